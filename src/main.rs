use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use skylark::api::CoreApi;
use skylark::application::engine::{FlowEngine, FlowEngineDeps};
use skylark::config::Config;
use skylark::domain::collaborators::{NullEmailSender, NullPushClient, PassthroughEncryptor};
use skylark::domain::voicemail::VoicemailRepository;
use skylark::infrastructure::media::mixer::ConferenceManager;
use skylark::infrastructure::media::prompts::{extract_system_prompts, PromptStore};
use skylark::infrastructure::media::{MediaEvent, MediaSessionManager, RtpPortPool};
use skylark::infrastructure::persistence::{
    connect, run_migrations, SqliteCdrRepository, SqliteConferenceBridgeRepository,
    SqliteEntityResolver, SqliteExtensionRepository, SqliteFlowRepository,
    SqliteInboundNumberRepository, SqliteIvrMenuRepository, SqlitePromptRepository,
    SqliteRegistrationRepository, SqliteRingGroupRepository, SqliteTimeSwitchRepository,
    SqliteTrunkRepository, SqliteVoicemailRepository,
};
use skylark::infrastructure::sip::actions::PbxActions;
use skylark::infrastructure::sip::auth::DigestVerifier;
use skylark::infrastructure::sip::call_router::{
    AckHandler, ByeHandler, CallRegistry, CallRouter, CancelHandler, InviteHandler,
};
use skylark::infrastructure::sip::dialog::DialogManager;
use skylark::infrastructure::sip::invite_client::InviteClient;
use skylark::infrastructure::sip::registrar::Registrar;
use skylark::infrastructure::sip::server::SipServer;
use skylark::infrastructure::sip::trunk_registrar::TrunkRegistrar;
use skylark::infrastructure::sip::SipMethod;

/// Tasks get this long to wind down before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting Skylark PBX");
    let config = Config::load("skylark.toml")?;

    // storage directories
    for dir in [
        &config.storage.recordings_dir,
        &config.storage.voicemail_dir,
        &config.storage.greetings_dir,
    ] {
        std::fs::create_dir_all(dir)?;
    }
    extract_system_prompts(&config.storage.prompts_dir)?;

    // store
    let pool = connect(&config.database.url).await?;
    run_migrations(&pool).await?;

    let extensions = Arc::new(SqliteExtensionRepository::new(pool.clone()));
    let registrations = Arc::new(SqliteRegistrationRepository::new(pool.clone()));
    let trunks = Arc::new(SqliteTrunkRepository::new(pool.clone()));
    let dids = Arc::new(SqliteInboundNumberRepository::new(pool.clone()));
    let ring_groups = Arc::new(SqliteRingGroupRepository::new(pool.clone()));
    let ivr_menus = Arc::new(SqliteIvrMenuRepository::new(pool.clone()));
    let time_switches = Arc::new(SqliteTimeSwitchRepository::new(pool.clone()));
    let conference_repo = Arc::new(SqliteConferenceBridgeRepository::new(pool.clone()));
    let prompt_repo = Arc::new(SqlitePromptRepository::new(pool.clone()));
    let voicemail = Arc::new(SqliteVoicemailRepository::new(pool.clone()));
    let flows = Arc::new(SqliteFlowRepository::new(pool.clone()));
    let cdr = Arc::new(SqliteCdrRepository::new(pool.clone()));
    let resolver = Arc::new(SqliteEntityResolver::new(pool.clone()));

    // external collaborators: none configured in the bare core
    let encryptor = Arc::new(PassthroughEncryptor::new());
    let email = Arc::new(NullEmailSender);
    let push = Arc::new(NullPushClient);

    // media plane
    let port_pool = Arc::new(RtpPortPool::new(
        config.media.rtp_port_min,
        config.media.rtp_port_max,
    ));
    let (media, media_events) = MediaSessionManager::new(
        port_pool,
        Duration::from_secs(config.media.idle_timeout_secs),
    );
    let _idle_sweep = media.spawn_idle_sweep();

    let dialogs = Arc::new(DialogManager::new(cdr.clone(), media.clone()));

    // SIP server and transports
    let mut server = SipServer::new(config.sip.clone());
    server.start().await?;
    let sender = server
        .sender()
        .expect("SIP server started without a sender");
    let transactions = server.transactions();

    let local_addr = format!("{}:{}", config.media.public_ip, config.sip.udp_bind.port());
    let verifier = Arc::new(DigestVerifier::new(&config.sip.realm));
    let registrar = Arc::new(Registrar::new(
        verifier.clone(),
        extensions.clone(),
        registrations.clone(),
        config.sip.max_register_expires,
    ));
    let _expiry_sweep = registrar.spawn_expiry_sweep();

    let invite_client = Arc::new(InviteClient::new(
        sender.clone(),
        transactions.clone(),
        local_addr.clone(),
        config.sip.realm.clone(),
    ));
    let registry = Arc::new(CallRegistry::new());
    let prompts = Arc::new(PromptStore::new(
        config.storage.prompts_dir.clone(),
        prompt_repo.clone(),
    ));
    let conferences = Arc::new(ConferenceManager::new());

    let actions = Arc::new(PbxActions {
        sender: sender.clone(),
        invite_client,
        registry: registry.clone(),
        registrar: registrar.clone(),
        dialogs: dialogs.clone(),
        prompts,
        conferences,
        conference_repo: conference_repo.clone(),
        extensions: extensions.clone(),
        registrations: registrations.clone(),
        trunks: trunks.clone(),
        push,
        local_addr: local_addr.clone(),
        public_ip: config.media.public_ip.clone(),
        domain: config.sip.realm.clone(),
        recordings_dir: config.storage.recordings_dir.clone(),
    });

    let engine = Arc::new(FlowEngine::new(FlowEngineDeps {
        actions: actions.clone(),
        extensions: extensions.clone(),
        ring_groups,
        ivr_menus,
        time_switches,
        voicemail: voicemail.clone(),
        conferences: conference_repo,
        flows,
        resolver,
        email,
        voicemail_dir: config.storage.voicemail_dir.clone(),
    }));

    let router = Arc::new(CallRouter {
        sender: sender.clone(),
        registry: registry.clone(),
        engine,
        actions,
        dialogs: dialogs.clone(),
        media: media.clone(),
        dids,
        trunks: trunks.clone(),
        extensions: extensions.clone(),
        local_addr: local_addr.clone(),
        public_ip: config.media.public_ip.clone(),
    });

    server
        .register_handler(SipMethod::Register, registrar.clone())
        .await;
    server
        .register_handler(SipMethod::Invite, Arc::new(InviteHandler::new(router)))
        .await;
    server
        .register_handler(
            SipMethod::Bye,
            Arc::new(ByeHandler::new(registry.clone(), dialogs.clone())),
        )
        .await;
    server
        .register_handler(
            SipMethod::Cancel,
            Arc::new(CancelHandler::new(registry.clone())),
        )
        .await;
    server
        .register_handler(
            SipMethod::Ack,
            Arc::new(AckHandler::new(registry.clone(), dialogs.clone())),
        )
        .await;

    // trunk state machines
    let trunk_registrar = Arc::new(TrunkRegistrar::new(
        sender,
        transactions,
        trunks.clone(),
        encryptor,
        local_addr,
    ));
    trunk_registrar.start_all().await?;

    // media idle timeouts tear the owning dialog down
    spawn_media_event_loop(media_events, registry.clone(), dialogs.clone());
    spawn_retention_sweep(voicemail);

    // the surface the admin collaborator calls into
    let _api = CoreApi::new(
        trunk_registrar.clone(),
        trunks,
        dialogs.clone(),
        registry.clone(),
    );

    info!("Skylark PBX ready");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    // cancel live calls, stop trunks, then give tasks the grace window
    for call in dialogs.active_calls().await {
        if let Some(leg) = registry.get(&call.call_id).await {
            leg.mark_ended();
        }
    }
    trunk_registrar.shutdown().await;
    server.stop();

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while registry.count().await > 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            "shutdown grace period expired with calls still live; media ports leak until restart"
        );
    }

    info!("Skylark PBX stopped");
    Ok(())
}

fn spawn_media_event_loop(
    mut events: tokio::sync::mpsc::Receiver<MediaEvent>,
    registry: Arc<CallRegistry>,
    dialogs: Arc<DialogManager>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MediaEvent::IdleTimeout { call_id, .. } => {
                    warn!(%call_id, "media timeout, failing call");
                    if let Some(leg) = registry.resolve(&call_id).await {
                        leg.mark_ended();
                    } else {
                        dialogs.fail_call(&call_id, "media_timeout").await;
                    }
                }
            }
        }
    });
}

/// Daily voicemail retention sweep: delete messages past their box's
/// retention window, files included.
fn spawn_retention_sweep(voicemail: Arc<SqliteVoicemailRepository>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        loop {
            ticker.tick().await;
            let boxes = match voicemail.list_boxes().await {
                Ok(boxes) => boxes,
                Err(e) => {
                    error!("retention sweep box listing failed: {}", e);
                    continue;
                }
            };
            for mailbox in boxes {
                if mailbox.retention_days == 0 {
                    continue;
                }
                let cutoff =
                    chrono::Utc::now() - chrono::Duration::days(mailbox.retention_days as i64);
                let expired = match voicemail.messages_older_than(mailbox.id, cutoff).await {
                    Ok(expired) => expired,
                    Err(e) => {
                        error!(box_id = mailbox.id, "retention query failed: {}", e);
                        continue;
                    }
                };
                for message in expired {
                    if let Err(e) = std::fs::remove_file(&message.file_path) {
                        warn!(path = %message.file_path, "could not delete voicemail file: {}", e);
                    }
                    if let Err(e) = voicemail.delete_message(message.id).await {
                        error!(message_id = message.id, "could not delete voicemail row: {}", e);
                    } else {
                        info!(box_id = mailbox.id, message_id = message.id, "voicemail expired");
                    }
                }
            }
        }
    });
}
