use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// One message waiting to be processed.
///
/// Items order by priority (lower first), then by creation time (earlier
/// first). Wrap in [`std::cmp::Reverse`] to pop the most urgent item from a
/// `BinaryHeap`.
///
/// Deserializing stamps a fresh creation time; a serialized `timestamp` is
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "QueuedMessage")]
pub struct WorkItem {
    filename: PathBuf,
    mail_server: String,
    mailbox: String,
    priority: i64,
    trust: String,
    mail_type: Option<i64>,
    headers: Vec<String>,
    timestamp: f64,
}

impl WorkItem {
    pub fn new(
        filename: impl Into<PathBuf>,
        mail_server: &str,
        mailbox: &str,
        priority: i64,
        trust: &str,
    ) -> Self {
        Self {
            filename: filename.into(),
            mail_server: mail_server.to_string(),
            mailbox: mailbox.to_string(),
            priority,
            trust: trust.to_string(),
            mail_type: None,
            headers: Vec::new(),
            timestamp: now(),
        }
    }

    pub fn with_mail_type(mut self, mail_type: i64) -> Self {
        self.mail_type = Some(mail_type);
        self
    }

    pub fn with_headers(mut self, headers: Vec<String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn filename(&self) -> &PathBuf {
        &self.filename
    }

    pub fn mail_server(&self) -> &str {
        &self.mail_server
    }

    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn trust(&self) -> &str {
        &self.trust
    }

    pub fn mail_type(&self) -> Option<i64> {
        self.mail_type
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Creation time in seconds since the Unix epoch.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

#[derive(Deserialize)]
struct QueuedMessage {
    filename: PathBuf,
    mail_server: String,
    mailbox: String,
    priority: i64,
    trust: String,
    #[serde(default)]
    mail_type: Option<i64>,
    #[serde(default)]
    headers: Vec<String>,
}

impl From<QueuedMessage> for WorkItem {
    fn from(message: QueuedMessage) -> Self {
        let item = WorkItem::new(
            message.filename,
            &message.mail_server,
            &message.mailbox,
            message.priority,
            &message.trust,
        )
        .with_headers(message.headers);

        match message.mail_type {
            Some(mail_type) => item.with_mail_type(mail_type),
            None => item,
        }
    }
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.timestamp.total_cmp(&other.timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;
    use std::thread;
    use std::time::Duration;

    fn item(priority: i64) -> WorkItem {
        WorkItem::new("samples/mail", "test_mail_server", "test_mailbox", priority, "test_trust")
    }

    #[test]
    fn test_work_item_fields() {
        let mail = item(1)
            .with_mail_type(1)
            .with_headers(vec!["header1".to_string(), "header2".to_string()]);

        assert_eq!(mail.filename(), &PathBuf::from("samples/mail"));
        assert_eq!(mail.mail_server(), "test_mail_server");
        assert_eq!(mail.mailbox(), "test_mailbox");
        assert_eq!(mail.priority(), 1);
        assert_eq!(mail.trust(), "test_trust");
        assert_eq!(mail.mail_type(), Some(1));
        assert_eq!(mail.headers(), ["header1", "header2"]);
        assert!(mail.timestamp() > 0.0);
    }

    #[test]
    fn test_priority_dominates_timestamp() {
        let early_lazy = item(2);
        thread::sleep(Duration::from_millis(5));
        let late_urgent = item(1);

        assert!(late_urgent < early_lazy);
    }

    #[test]
    fn test_equal_priority_orders_by_creation() {
        let mail_1 = item(1);
        thread::sleep(Duration::from_millis(5));
        let mail_3 = item(1);

        assert!(mail_1 < mail_3);
        assert!(!(mail_3 < mail_1));
        assert_eq!(mail_1.cmp(&mail_1.clone()), Ordering::Equal);
    }

    #[test]
    fn test_heap_pops_most_urgent_first() {
        let mut heap = BinaryHeap::new();
        for priority in [3, 1, 2] {
            heap.push(Reverse(item(priority)));
            thread::sleep(Duration::from_millis(2));
        }
        heap.push(Reverse(item(1)));

        let order: Vec<(i64, f64)> = std::iter::from_fn(|| heap.pop())
            .map(|Reverse(i)| (i.priority(), i.timestamp()))
            .collect();

        assert_eq!(
            order.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
            vec![1, 1, 2, 3]
        );
        assert!(order[0].1 < order[1].1);
    }

    #[test]
    fn test_deserialize_restamps_timestamp() {
        let queued = item(1);
        thread::sleep(Duration::from_millis(5));
        let incoming: WorkItem = serde_json::from_value(serde_json::json!({
            "filename": "samples/mail",
            "mail_server": "test_mail_server",
            "mailbox": "test_mailbox",
            "priority": 1,
            "trust": "test_trust",
            "headers": ["header1"],
            "timestamp": 0.0
        }))
        .unwrap();

        assert!(incoming.timestamp() > queued.timestamp());
        assert!(queued < incoming);
        assert_eq!(incoming.headers(), ["header1"]);
        assert_eq!(incoming.mail_type(), None);
    }
}
