use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser as _;
use eyre::Context as _;
use secrecy::ExposeSecret as _;
use starcite_client::{
    AppendInput, Client, ClientConfig, ConsumeOptions, FileCursorStore, ProducerIdentity, Session,
    TailOptions,
};
use starcite_test_utils::health_checks;
use starcite_types::api::v1::CreateSessionRequest;
use starcite_types::{Seq, SessionId};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{
    AppendCommand, Command, DevClientConfig, StressAppendCommand, TailCommand,
};

mod config;

/// Loads the persisted producer identity, or generates and stores a fresh
/// one. Keeping the identity across runs lets the server dedupe retries and
/// keeps the producer sequence monotonic over reboots.
fn load_identity(state_dir: &Path) -> eyre::Result<ProducerIdentity> {
    let path = state_dir.join("producer.json");
    if let Ok(contents) = std::fs::read_to_string(&path) {
        return serde_json::from_str(&contents).context("while parsing producer.json");
    }
    let identity = ProducerIdentity::generate();
    std::fs::create_dir_all(state_dir).context("while creating the state dir")?;
    std::fs::write(&path, serde_json::to_string_pretty(&identity)?)
        .context("while writing producer.json")?;
    tracing::info!("generated producer identity {}", identity.producer_id);
    Ok(identity)
}

fn save_identity(state_dir: &Path, identity: &ProducerIdentity) -> eyre::Result<()> {
    std::fs::write(
        state_dir.join("producer.json"),
        serde_json::to_string_pretty(identity)?,
    )
    .context("while writing producer.json")
}

async fn create(client: &Client, session: &str) -> eyre::Result<()> {
    match client
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from(session)),
            ..CreateSessionRequest::default()
        })
        .await
    {
        Ok(record) => tracing::info!("created session {} (head {})", record.id, record.last_seq),
        Err(err) if err.is_session_exists() => {
            tracing::info!("session {session} already exists")
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

async fn append(session: &Session, cmd: AppendCommand) -> eyre::Result<()> {
    let response = session
        .append(AppendInput {
            idempotency_key: cmd.idempotency_key,
            ..AppendInput::text(cmd.text)
        })
        .await?;
    tracing::info!(
        "appended seq {} (head {}, deduped: {})",
        response.seq,
        response.last_seq,
        response.deduped
    );
    Ok(())
}

async fn tail(session: &Session, cmd: TailCommand, cancel: CancellationToken) -> eyre::Result<()> {
    let mut stream = session.tail(TailOptions {
        cursor: Seq::new(cmd.cursor),
        follow: !cmd.catch_up,
        agent: cmd.agent,
        cancel: Some(cancel),
        on_lifecycle: Some(Arc::new(|event| tracing::debug!("lifecycle: {event:?}"))),
        ..TailOptions::default()
    })?;
    while let Some(event) = stream.next_event().await {
        let event = event?;
        println!("{}", serde_json::to_string(&event)?);
    }
    tracing::info!("tail ended at cursor {}", stream.cursor());
    Ok(())
}

async fn consume(
    session: &Session,
    state_dir: &Path,
    cancel: CancellationToken,
) -> eyre::Result<()> {
    let store = Arc::new(FileCursorStore::new(state_dir));
    session
        .consume(
            ConsumeOptions {
                cursor: None,
                cursor_store: store,
                tail: TailOptions {
                    cancel: Some(cancel),
                    ..TailOptions::default()
                },
            },
            |event| async move {
                println!("{}", serde_json::to_string(&event)?);
                Ok(())
            },
        )
        .await?;
    Ok(())
}

fn avg(durations: &[Duration]) -> Duration {
    let n = durations.len();
    if n != 0 {
        let total = durations.iter().sum::<Duration>();
        total / n as u32
    } else {
        Duration::ZERO
    }
}

async fn stress_append(session: &Session, cmd: StressAppendCommand) -> eyre::Result<()> {
    tracing::info!("start sending append requests..");
    let mut results = JoinSet::new();
    let start = Instant::now();
    for idx in 0..cmd.runs {
        let session = session.clone();
        results.spawn(async move {
            let append_start = Instant::now();
            let response = session
                .append(AppendInput::text(format!("stress append {idx}")))
                .await?;
            Ok::<_, starcite_client::Error>((response, append_start.elapsed()))
        });
        if cmd.sequential {
            results.join_next().await;
        }
    }
    let results = results.join_all().await;
    let full_duration = start.elapsed();

    let mut durations = Vec::with_capacity(cmd.runs);
    for result in results {
        match result {
            Ok((_, duration)) => durations.push(duration),
            Err(err) => tracing::error!("Got an error during append: {err:?}"),
        }
    }
    if durations.len() != cmd.runs {
        eyre::bail!("append did encounter errors - see logs");
    }
    let throughput = cmd.runs as f64 / full_duration.as_secs_f64();
    let append_avg = avg(&durations);
    tracing::info!(
        "append - total time: {full_duration:?} avg: {append_avg:?} throughput: {throughput} req/s"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("starcite_dev_client=debug,info")),
        )
        .init();
    let config = DevClientConfig::parse();
    tracing::info!("starting starcite-dev-client with config: {config:#?}");

    tracing::info!("health check..");
    health_checks::server_health_check(&config.url, config.max_wait_time)
        .await
        .context("while doing health checks")?;
    tracing::info!("server online..");

    let mut client_config = ClientConfig::new(config.url.clone());
    if let Some(api_key) = &config.api_key {
        client_config = client_config.with_api_key(api_key.expose_secret());
    }
    let client = Client::new(client_config)?;

    let identity = load_identity(&config.state_dir)?;
    let session = client.session_with_identity(config.session.as_str(), identity);

    // a cancelled token lets tails and consumers close their sockets cleanly
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down..");
                cancel.cancel();
            }
        }
    });

    match config.command.clone() {
        Command::Create => create(&client, &config.session).await?,
        Command::Append(cmd) => {
            append(&session, cmd).await?;
            save_identity(&config.state_dir, &session.identity())?;
        }
        Command::Tail(cmd) => tail(&session, cmd, cancel).await?,
        Command::Consume => consume(&session, &config.state_dir, cancel).await?,
        Command::StressAppend(cmd) => {
            stress_append(&session, cmd).await?;
            save_identity(&config.state_dir, &session.identity())?;
        }
    }

    Ok(())
}
