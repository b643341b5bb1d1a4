//! Retro board demo
//!
//! Hosts a session and lets three contributors join, then prints the
//! grouped board. Peers talk over the in-process network by default, or
//! over TCP with `--tcp`. The TCP run uses the rendezvous server named by
//! `RETRO_RENDEZVOUS`, starting a local one when it is unset.
//!
//! Usage:
//!   board-demo [--tcp] [CODE] [STORE_DIR]
//!   board-demo rendezvous [ADDR]

use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;

use retro_core::{Category, NoteCategory, SessionCode};
use retro_runtime::{
    init_logging, ContributorEndpoint, Driver, DriverHandle, LoggingConfig, ModeratorEndpoint,
    SessionConfig,
};
use retro_store::{FileStore, SnapshotStore};
use retro_transport::{MemoryNetwork, RendezvousServer, TcpTransport, Transport};

const DEFAULT_RENDEZVOUS: &str = "127.0.0.1:7400";

const SUBMISSIONS: &[(&str, Category, &str)] = &[
    ("Hans", Category::Good, "Good retro"),
    ("Lena", Category::Good, "good retro "),
    ("Lena", Category::Bad, "Too many meetings"),
    ("Mia", Category::Neutral, "Coffee machine"),
    ("Mia", Category::Bad, "too many MEETINGS"),
    ("Hans", Category::Task, "Book a shorter standup"),
];

async fn wait_connected<T: Transport + Send + 'static>(
    handle: &DriverHandle<ContributorEndpoint<T>>,
) -> bool {
    for _ in 0..100 {
        if handle.exec(|c: &mut ContributorEndpoint<T>, _| c.is_connected()).await == Ok(true) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    if let Err(e) = init_logging(&LoggingConfig::default()) {
        eprintln!("logging disabled: {e}");
    }

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("rendezvous") {
        let addr: SocketAddr = args
            .get(1)
            .map_or(DEFAULT_RENDEZVOUS, String::as_str)
            .parse()?;
        let server = RendezvousServer::bind(addr).await?;
        println!("Rendezvous listening on {}", server.local_addr());
        server.run().await;
        return Ok(());
    }

    let tcp = match args.iter().position(|a| a == "--tcp") {
        Some(index) => {
            args.remove(index);
            true
        }
        None => false,
    };
    let code = match args.first() {
        Some(raw) => SessionCode::parse(raw)?,
        None => SessionCode::generate(),
    };
    let store = match args.get(1) {
        Some(dir) => Some(SnapshotStore::new(FileStore::open(dir)?)),
        None => None,
    };
    let config = SessionConfig::from_env();

    if tcp {
        let (rendezvous, _local) = match std::env::var("RETRO_RENDEZVOUS") {
            Ok(addr) => (addr.parse::<SocketAddr>()?, None),
            Err(_) => {
                let server = RendezvousServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                    .await?
                    .spawn();
                (server.local_addr(), Some(server))
            }
        };
        println!("Using rendezvous at {rendezvous}");
        run(code, store, config, || TcpTransport::new(rendezvous)).await
    } else {
        let network = MemoryNetwork::new();
        run(code, store, config, || {
            Ok::<_, std::convert::Infallible>(network.transport())
        })
        .await
    }
}

async fn run<T, E, F>(
    code: SessionCode,
    store: Option<SnapshotStore>,
    config: SessionConfig,
    make_transport: F,
) -> Result<(), Box<dyn Error>>
where
    T: Transport + Send + 'static,
    E: Error + 'static,
    F: Fn() -> Result<T, E>,
{
    let moderator = ModeratorEndpoint::open(code.clone(), make_transport()?, config.clone(), store)?;
    println!("Hosting session {} as {}", code, moderator.identity());
    let (host, host_task) = Driver::spawn(moderator, config.poll_interval);

    let mut guests = Vec::new();
    for name in ["Hans", "Lena", "Mia"] {
        let contributor = ContributorEndpoint::new(make_transport()?, config.clone(), None);
        let (handle, task) = Driver::spawn(contributor, config.poll_interval);
        let join_code = code.clone();
        let author = name.to_string();
        handle
            .exec(move |c: &mut ContributorEndpoint<T>, now| {
                c.set_author(&author);
                c.join(join_code, now)
            })
            .await??;
        if !wait_connected(&handle).await {
            println!("{name} could not connect");
        }
        guests.push((name, handle, task));
    }

    for (author, category, content) in SUBMISSIONS {
        let Some((_, handle, _)) = guests.iter().find(|(name, _, _)| name == author) else {
            continue;
        };
        let author = author.to_string();
        let category = *category;
        let content = content.to_string();
        handle
            .exec(move |c: &mut ContributorEndpoint<T>, _| {
                c.submit_note(&content, Some(category), &author)
            })
            .await??;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    let summary = host
        .exec(|m: &mut ModeratorEndpoint<T>, _| {
            m.toggle_reveal();
            let revealed = m.state().is_revealed();
            let labels = m.state().labels().clone();
            let ready = m.state().roster().ready_count();
            let participants = m.participants().len();
            let tasks: Vec<String> = m.state().tasks().iter().map(|t| t.text.clone()).collect();

            let mut lines = vec![format!("{participants} participants, {ready} ready")];
            let board = m.board();
            for category in NoteCategory::ALL {
                lines.push(format!("[{}]", labels.get(category.into())));
                for group in board.groups(category) {
                    lines.push(format!(
                        "  {} x{} by {} ({})",
                        group.visible_content(revealed).unwrap_or("***"),
                        group.count,
                        group.authors.join(", "),
                        group.style.color,
                    ));
                }
            }
            lines.push(format!("[{}]", labels.task));
            for task in tasks {
                lines.push(format!("  - {task}"));
            }
            lines
        })
        .await?;

    for line in summary {
        println!("{line}");
    }

    for (_, handle, task) in guests {
        handle.shutdown();
        let _ = task.await;
    }
    host.shutdown();
    let moderator = host_task.await?;
    tracing::info!(notes = moderator.state().notes().len(), "demo finished");

    Ok(())
}
