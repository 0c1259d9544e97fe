//! The PBX daemon: loads config, wires every crate's pieces together,
//! and drives the SIP transport loop until the process is killed.

mod config;
mod registry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pbx_call::call::CallManager;
use pbx_call::cdr::TracingCdrSink;
use pbx_call::handler_impl::PbxHandler;
use pbx_call::router::Router;
use pbx_dialog::auth::FailureTracker;
use pbx_dialog::dialog::DialogTable;
use pbx_dialog::transaction::{self, TransactionTable};
use pbx_dialog::transport::SipTransport;
use pbx_registrar::extension::Extension;
use pbx_registrar::registrar::{Registrar, DEFAULT_MAX_EXPIRES};
use pbx_registrar::sweeper::ExpirySweeper;
use pbx_rtp::relay::RtpRelay;
use pbx_voicemail::sink::FilesystemSink;
use tracing_subscriber::EnvFilter;

use crate::config::PbxConfig;
use crate::registry::ConfigExtensionRegistry;

const EARLY_DIALOG_TIMEOUT: Duration = Duration::from_secs(32);
const DIALOG_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const RTP_SWEEP_INTERVAL: Duration = Duration::from_secs(15);
const TRANSACTION_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("pbxd.toml"));
    let config = PbxConfig::load(&config_path).context("loading configuration")?;

    tracing::info!(sip_port = config.server.sip_port, external_ip = %config.server.external_ip, "starting pbx core");

    let registrar = Arc::new(Registrar::new(DEFAULT_MAX_EXPIRES));
    for entry in &config.extensions {
        let ha1 = pbx_dialog::auth::compute_ha1(&entry.number, &config.server.realm, &entry.password);
        let mut extension = Extension::new(entry.number.as_str(), entry.display_name.as_str(), ha1);
        extension.capabilities.has_voicemail = entry.has_voicemail;
        if let Err(e) = registrar.provision(extension) {
            tracing::warn!(number = %entry.number, error = %e, "skipping duplicate extension");
        }
    }

    let relay = Arc::new(RtpRelay::new(
        std::net::IpAddr::from([0, 0, 0, 0]),
        config.server.rtp_port_range.low,
        config.server.rtp_port_range.high,
        pbx_rtp::relay::DEFAULT_IDLE_TIMEOUT,
    ));

    let voicemail_sink = Arc::new(FilesystemSink::new(config.features.voicemail.storage_dir.as_str()));
    let prompts = Arc::new(pbx_media::prompts::PromptResolver::new(config.features.voicemail.prompt_dir.clone().map(PathBuf::from)));
    let call_manager = Arc::new(CallManager::new());
    let cdr = Arc::new(TracingCdrSink);
    let extensions = Arc::new(ConfigExtensionRegistry::new(&config.extensions));

    let dialogs = Arc::new(DialogTable::new(EARLY_DIALOG_TIMEOUT));
    let transactions = Arc::new(TransactionTable::new());
    transaction::spawn_sweeper(transactions.clone(), TRANSACTION_SWEEP_INTERVAL);
    let failures = Arc::new(FailureTracker::new(
        config.security.register_fail_threshold,
        Duration::from_secs(config.security.register_block_seconds),
    ));

    let transport =
        Arc::new(SipTransport::bind(config.bind_addr(), transactions.clone(), dialogs.clone()).await.context("binding SIP transport")?);
    tracing::info!(addr = ?transport.local_addr()?, "listening for SIP traffic");

    let router = Arc::new(Router::new(
        call_manager.clone(),
        registrar.clone(),
        relay.clone(),
        voicemail_sink.clone(),
        prompts.clone(),
        cdr.clone(),
        transport.socket(),
        transactions,
        config.server.external_ip.clone(),
        &config.dialplan.internal_pattern,
        Duration::from_secs(config.features.voicemail.no_answer_seconds),
        config.features.voicemail.max_record_seconds,
        Duration::from_millis(config.features.dtmf.debounce_ms),
        config.features.dtmf.payload_type,
    ));

    let handler = Arc::new(PbxHandler {
        call_manager: call_manager.clone(),
        router,
        registrar: registrar.clone(),
        extensions,
        relay: relay.clone(),
        dialogs: dialogs.clone(),
        cdr,
        failures,
        realm: config.server.realm.clone(),
        local_address: config.server.external_ip.clone(),
        dtmf_payload_type: config.features.dtmf.payload_type,
        ilbc_mode: config.features.ilbc.mode,
    });

    let sweeper = Arc::new(ExpirySweeper::new(registrar.clone()));
    sweeper.start().await;
    spawn_dialog_sweep(dialogs.clone());
    spawn_relay_sweep(relay.clone());

    transport.run(handler).await.context("SIP transport loop exited")?;
    sweeper.stop().await;
    Ok(())
}

fn spawn_dialog_sweep(dialogs: Arc<DialogTable>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DIALOG_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            dialogs.sweep_expired_early();
        }
    });
}

fn spawn_relay_sweep(relay: Arc<RtpRelay>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RTP_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            relay.sweep_idle();
        }
    });
}
