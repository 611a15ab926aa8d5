use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use dns01_issuer::{
    config::IssuanceConfig,
    issuance::{
        CleanupSet, IssuanceWorkflow, RecordKey, WorkflowSettings,
        acme::AcmeLibAuthority,
        delay::ThreadSleeper,
        dns_providers::provider_from_config,
        flow::resolve_account_key,
    },
    notify::{self, Notification, notifier_from_config},
    storage::FileCertificateStore,
};

/// Issue a certificate through ACME DNS-01 with automated TXT record management.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "DNS01_CONFIG", default_value = "dns01.json")]
    config: PathBuf,

    /// Validate configuration and print the records a run would publish, then exit
    #[arg(long)]
    dry_run: bool,

    /// Issue from Let's Encrypt production, overriding acme.directory_url
    #[arg(long)]
    production: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("[main] {:#}", err);
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> Result<bool> {
    let mut config = IssuanceConfig::load(&args.config)?;
    if args.production {
        config.use_production_directory();
    }
    let dns = provider_from_config(&config.dns).context("failed to set up DNS provider")?;
    let key_spec = config.key_spec()?;
    let notifier =
        notifier_from_config(&config.notify).context("failed to set up notifications")?;

    if args.dry_run {
        print_plan(&config, dns.id(), notifier.id())?;
        return Ok(true);
    }

    let store = FileCertificateStore::new(config.paths(), config.key_password().map(str::to_string));
    let account_key_pem = resolve_account_key(&store)?;
    let authority = AcmeLibAuthority::new(
        config.acme.directory_url.clone(),
        account_key_pem.clone(),
        Duration::from_secs(config.challenge.poll_interval_secs),
        Duration::from_millis(config.challenge.finalize_poll_millis),
    );
    let settings = WorkflowSettings {
        contact_email: config.acme.contact_email.clone(),
        domains: config.domains.clone(),
        account_key_pem,
        key_spec,
        reuse_private_key: config.keys.reuse_private_key,
        poll_policy: config.challenge.poll_policy(),
    };

    info!(
        "[main] issuing for {} via {} against {}",
        config.domains.join(", "),
        dns.id(),
        config.acme.directory_url
    );
    let sleeper = ThreadSleeper;
    let workflow = IssuanceWorkflow::new(&authority, dns.as_ref(), &store, &sleeper, settings);
    let report = workflow.run();

    notify::deliver(notifier.as_ref(), &Notification::from_report(&report));

    if report.success {
        for path in &report.files {
            info!("[main] wrote {}", path.display());
        }
    }
    Ok(report.success)
}

fn print_plan(config: &IssuanceConfig, provider: &str, notifier: &str) -> Result<()> {
    let mut records = CleanupSet::new();
    for domain in &config.domains {
        records.insert(RecordKey::for_domain(domain)?);
    }
    println!("directory: {}", config.acme.directory_url);
    println!("dns provider: {provider}");
    println!("notifier: {notifier}");
    for key in records.iter() {
        println!(
            "  {:<24} TXT {} (zone {})",
            key.domain,
            key.record_name(),
            key.base_domain
        );
    }
    let paths = config.paths();
    println!("account key: {}", paths.account_key.display());
    println!("private key: {}", paths.private_key.display());
    println!("certificate: {}", paths.certificate.display());
    println!("full chain:  {}", paths.full_chain.display());
    Ok(())
}
