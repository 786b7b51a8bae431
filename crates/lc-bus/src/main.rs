//! # ledcast frame bus
//!
//! Standalone registry of named shared-memory frame slots. External
//! producers (a text animator, a phone browser bridge, a script) create
//! a slot, write frames into it, and a cast with a `queue=` source
//! reads them. The bus only brokers names and dimensions; pixels never
//! cross this socket.
//!
//! Protocol: newline-delimited JSON over TCP, see `lc_protocol::bus`.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing_subscriber::EnvFilter;

use lc_common::statefile::{self, BootstrapState};
use lc_common::AppConfig;
use lc_protocol::bus::{read_message, write_message, BusRequest, BusResponse};
use lc_protocol::slot::slot_path;
use lc_protocol::FrameSlot;

#[derive(Debug, Clone)]
struct SlotMeta {
    width: u32,
    height: u32,
    path: PathBuf,
}

type Registry = Arc<DashMap<String, SlotMeta>>;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = AppConfig::load()
        .map(|c| c.server.bus_port)
        .unwrap_or(lc_protocol::BUS_PORT);

    let listener = TcpListener::bind(("127.0.0.1", port))?;
    tracing::info!(port, "frame bus listening");

    // Advertise ourselves for auxiliary processes.
    let state_path = statefile::default_path();
    let mut bootstrap = BootstrapState::load(&state_path);
    bootstrap.server_port = port;
    if let Err(e) = bootstrap.store(&state_path) {
        tracing::warn!(error = %e, "bootstrap state update failed");
    }

    let registry: Registry = Arc::new(DashMap::new());
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || serve_client(stream, registry));
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
    Ok(())
}

fn serve_client(stream: TcpStream, registry: Registry) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "client socket clone failed");
            return;
        }
    };
    let mut reader = BufReader::new(stream);

    loop {
        let request: BusRequest = match read_message(&mut reader) {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "bad request");
                let _ = write_message(&mut writer, &BusResponse::error(e.to_string()));
                continue;
            }
        };
        let stop = matches!(request, BusRequest::Stop);
        let response = handle_request(&registry, request);
        if write_message(&mut writer, &response).is_err() {
            break;
        }
        if stop {
            tracing::info!("stop requested, frame bus exiting");
            std::process::exit(0);
        }
    }
    tracing::debug!(peer = %peer, "client disconnected");
}

fn handle_request(registry: &Registry, request: BusRequest) -> BusResponse {
    match request {
        BusRequest::Create {
            name,
            width,
            height,
        } => {
            if registry.contains_key(&name) {
                return BusResponse::error(format!("slot '{name}' already exists"));
            }
            if width == 0 || height == 0 {
                return BusResponse::error("slot dimensions must be non-zero");
            }
            let path = slot_path(&name);
            match FrameSlot::create(&path, width, height) {
                Ok(_) => {
                    tracing::info!(name = %name, width, height, "slot created");
                    registry.insert(
                        name.clone(),
                        SlotMeta {
                            width,
                            height,
                            path: path.clone(),
                        },
                    );
                    BusResponse::Slot {
                        name,
                        width,
                        height,
                        path: path.display().to_string(),
                    }
                }
                Err(e) => BusResponse::error(format!("slot allocation failed: {e}")),
            }
        }
        BusRequest::Attach { name } | BusRequest::Info { name } => match registry.get(&name) {
            Some(meta) => BusResponse::Slot {
                name: name.clone(),
                width: meta.width,
                height: meta.height,
                path: meta.path.display().to_string(),
            },
            None => BusResponse::error(format!("no slot named '{name}'")),
        },
        BusRequest::Delete { name } => match registry.remove(&name) {
            Some((_, meta)) => {
                if let Err(e) = std::fs::remove_file(&meta.path) {
                    tracing::warn!(name = %name, error = %e, "slot file removal failed");
                }
                tracing::info!(name = %name, "slot deleted");
                BusResponse::Ok
            }
            None => BusResponse::error(format!("no slot named '{name}'")),
        },
        BusRequest::List => {
            let mut names: Vec<String> = registry.iter().map(|e| e.key().clone()).collect();
            names.sort();
            BusResponse::Slots { names }
        }
        BusRequest::Status => BusResponse::Running {
            slots: registry.len(),
        },
        BusRequest::Stop => BusResponse::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> Registry {
        std::env::set_var(
            "LEDCAST_RUNTIME_DIR",
            std::env::temp_dir().join(format!("lc-bus-test-{}", std::process::id())),
        );
        Arc::new(DashMap::new())
    }

    #[test]
    fn create_attach_list_delete_cycle() {
        let registry = test_registry();

        let created = handle_request(
            &registry,
            BusRequest::Create {
                name: "feed1".into(),
                width: 32,
                height: 32,
            },
        );
        let BusResponse::Slot { path, width, .. } = created else {
            panic!("create failed: {created:?}");
        };
        assert_eq!(width, 32);
        assert!(std::path::Path::new(&path).exists());

        // duplicate rejected
        let dup = handle_request(
            &registry,
            BusRequest::Create {
                name: "feed1".into(),
                width: 16,
                height: 16,
            },
        );
        assert!(matches!(dup, BusResponse::Error { .. }));

        let info = handle_request(&registry, BusRequest::Info { name: "feed1".into() });
        assert!(matches!(info, BusResponse::Slot { height: 32, .. }));

        let list = handle_request(&registry, BusRequest::List);
        assert_eq!(
            list,
            BusResponse::Slots {
                names: vec!["feed1".into()]
            }
        );

        let deleted = handle_request(&registry, BusRequest::Delete { name: "feed1".into() });
        assert_eq!(deleted, BusResponse::Ok);
        assert!(!std::path::Path::new(&path).exists());
        assert_eq!(
            handle_request(&registry, BusRequest::Status),
            BusResponse::Running { slots: 0 }
        );
    }

    #[test]
    fn unknown_slot_errors() {
        let registry = test_registry();
        assert!(matches!(
            handle_request(&registry, BusRequest::Attach { name: "ghost".into() }),
            BusResponse::Error { .. }
        ));
        assert!(matches!(
            handle_request(&registry, BusRequest::Delete { name: "ghost".into() }),
            BusResponse::Error { .. }
        ));
    }

    #[test]
    fn zero_sized_slot_rejected() {
        let registry = test_registry();
        let resp = handle_request(
            &registry,
            BusRequest::Create {
                name: "bad".into(),
                width: 0,
                height: 8,
            },
        );
        assert!(matches!(resp, BusResponse::Error { .. }));
    }
}
