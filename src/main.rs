use clap::{Arg, Command};
use log::LevelFilter;
use mail_reshaper::config_loader::{Catalog, Settings};
use mail_reshaper::output::{Document, Sink, QUEUEING_SINK};
use mail_reshaper::pipeline::MailProcessor;
use std::path::Path;
use std::process;
use std::sync::Arc;

fn main() {
    let matches = Command::new("mail-reshaper")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Fingerprints attachments, extracts URLs and shapes parsed mail for sinks")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Settings file path")
                .default_value("/etc/mail-reshaper.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a default settings file and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Load settings, keyword lists and whitelists, then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("mail")
                .short('m')
                .long("mail")
                .value_name("FILE")
                .help("Parsed mail record (JSON) to process")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("sink")
                .short('s')
                .long("sink")
                .value_name("ID")
                .help("Target sink identifier (output-elasticsearch, output-redis)")
                .default_value(QUEUEING_SINK),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/mail-reshaper.yaml");

    let settings = match Settings::from_file(Path::new(config_path)) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    let catalog = match Catalog::load(&settings) {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("Error loading keywords or whitelists: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("Configuration OK");
        println!("  Subject keywords: {}", catalog.subjects.len());
        println!("  Target labels: {}", catalog.targets.len());
        println!("  Whitelisted domains: {}", catalog.whitelist.len());
        return;
    }

    let Some(mail_path) = matches.get_one::<String>("mail") else {
        eprintln!("Nothing to do: pass --mail, --test-config or --generate-config");
        process::exit(2);
    };

    let sink_id = matches
        .get_one::<String>("sink")
        .map(String::as_str)
        .unwrap_or(QUEUEING_SINK);
    let sink = match Sink::from_settings(sink_id, settings.elasticsearch.as_ref()) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("Invalid sink: {e}");
            process::exit(1);
        }
    };

    let mail = match load_mail(mail_path) {
        Ok(mail) => mail,
        Err(e) => {
            eprintln!("Error reading mail record: {e:#}");
            process::exit(1);
        }
    };

    let processor = MailProcessor::new(Arc::new(catalog), &settings);
    match processor.process(mail, &sink) {
        Ok((mail_doc, attachment_docs)) => {
            for doc in std::iter::once(&mail_doc).chain(attachment_docs.iter()) {
                match serde_json::to_string(doc) {
                    Ok(line) => println!("{line}"),
                    Err(e) => log::error!("Failed to serialize document: {e}"),
                }
            }
        }
        Err(e) => {
            eprintln!("Failed to process {mail_path}: {e:#}");
            process::exit(1);
        }
    }
}

fn load_mail(path: &str) -> anyhow::Result<Document> {
    use anyhow::Context;

    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    serde_json::from_str(&content).with_context(|| format!("{path} is not a JSON object"))
}

fn generate_default_config(path: &str) {
    let settings = Settings::default();
    let result = serde_yaml::to_string(&settings)
        .map_err(anyhow::Error::from)
        .and_then(|content| std::fs::write(path, content).map_err(anyhow::Error::from));

    match result {
        Ok(()) => println!("Default configuration written to: {path}"),
        Err(e) => {
            eprintln!("Error writing configuration: {e}");
            process::exit(1);
        }
    }
}
