use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use rand::Rng;
use size::{Size, Style};

use peerpull::config::{SchedulerOptions, TaskOptions};
use peerpull::downloader::HttpPieceDownloader;
use peerpull::scheduler::{
    self, PeerHost, PeerPacketStream, RegisterResult, SchedulerClient, TaskRequest, UrlMeta,
};
use peerpull::storage::MemoryPieceStorage;
use peerpull::task::callback::StorageCallback;
use peerpull::task::peer_task::PeerTask;

/// Stands in when no scheduler endpoint is configured: registration fails,
/// which sends the task straight down the back-source path.
struct NoScheduler;

#[async_trait]
impl SchedulerClient for NoScheduler {
    async fn register_peer_task(&self, _request: &TaskRequest) -> anyhow::Result<RegisterResult> {
        Err(anyhow!("no scheduler endpoint configured"))
    }

    async fn report_piece_result(
        &self,
        _task_id: &str,
        _request: &TaskRequest,
    ) -> anyhow::Result<PeerPacketStream> {
        Ok(PeerPacketStream::Stub)
    }
}

fn local_peer_host() -> PeerHost {
    let mut rng = rand::rng();
    let uuid: String = (0..32)
        .map(|_| char::from_digit(rng.random_range(0..16), 16).expect("digit in radix"))
        .collect();
    PeerHost {
        uuid,
        ip: "127.0.0.1".to_string(),
        rpc_port: 65000,
        down_port: 65002,
        hostname: env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        security_domain: String::new(),
        location: String::new(),
        idc: String::new(),
        net_topology: String::new(),
    }
}

fn humanized(bytes: i64) -> String {
    if bytes < 0 {
        return "unknown".to_string();
    }
    Size::from_bytes(bytes)
        .format()
        .with_style(Style::Abbreviated)
        .to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let args: Vec<_> = env::args().collect();
    if args.len() < 3 {
        println!("usage: peerpull <url> <output file>");
        exit(1);
    }
    let url = args[1].clone();
    let output = PathBuf::from(&args[2]);
    log::info!("peerpull ({}) downloading {url}", env!("GIT_COMMIT"));

    let host = local_peer_host();
    let peer_id = scheduler::generate_peer_id(&host.ip);
    let request = TaskRequest {
        url,
        url_meta: UrlMeta::default(),
        peer_id,
        peer_host: host,
    };

    let options = TaskOptions::new(output);
    let storage = Arc::new(MemoryPieceStorage::new());
    let downloader = Arc::new(HttpPieceDownloader::new(
        storage.clone(),
        options.piece_size,
    )?);
    let callback = Arc::new(StorageCallback::new(storage.clone(), options.output.clone()));

    let (task, mut progress) = PeerTask::new(
        request,
        Arc::new(NoScheduler),
        downloader,
        storage,
        callback,
        SchedulerOptions::default(),
        options.per_peer_rate_limit,
    )
    .await?;
    task.start();

    while let Some(event) = progress.recv().await {
        if event.done {
            event
                .done_ack
                .expect("terminal progress carries the ack handle")
                .ack();
            if event.state.success {
                log::info!(
                    "download ok, stored to {}, traffic: {}",
                    options.output.display(),
                    humanized(task.traffic())
                );
                return Ok(());
            }
            log::error!(
                "download failed, code: {}, reason: {}",
                event.state.code,
                event.state.msg
            );
            exit(1);
        }
        log::info!(
            "downloaded {} / {}",
            humanized(event.completed_length),
            humanized(event.content_length)
        );
    }
    Err("progress channel closed before any terminal event".into())
}
