//! `courier simulate`: negotiate a host page and its frames in-process.
//!
//! Every context runs a real [`Courier`] over a [`MemoryNetwork`]. After
//! discovery settles, every context answers `ping`, and the first frame
//! pings each of its peers.

use crate::cli::SimulateArgs;
use crate::table::Table;
use crate::ui;
use courier_types::{CourierConfig, CourierResult};
use courier_wire::envelope::ROOT_ID;
use courier_wire::{listener, Courier, MemoryNetwork, Role, WindowId};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const HOST_ORIGIN: &str = "https://host.example";

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub deliveries: usize,
    pub contexts: Vec<ContextReport>,
    pub replies: Vec<ReplyReport>,
}

#[derive(Debug, Serialize)]
pub struct ContextReport {
    pub id: String,
    pub role: String,
    pub origin: String,
    pub tags: Vec<String>,
    pub peers: Vec<PeerReport>,
}

#[derive(Debug, Serialize)]
pub struct PeerReport {
    pub id: String,
    pub tags: Vec<String>,
    pub origin: String,
    pub channel: String,
}

#[derive(Debug, Serialize)]
pub struct ReplyReport {
    pub peer: String,
    pub payload: Value,
}

fn display_id(id: &str) -> &str {
    if id == ROOT_ID {
        "(root)"
    } else {
        id
    }
}

fn context_report(courier: &Courier, origin: String) -> ContextReport {
    let role = match courier.role() {
        Role::Root => "root",
        Role::Child => "child",
    };
    ContextReport {
        id: courier.id().unwrap_or_default(),
        role: role.to_string(),
        origin,
        tags: courier.tags(),
        peers: courier
            .peers()
            .into_iter()
            .map(|p| PeerReport {
                channel: p.channel.kind().to_string(),
                id: p.id,
                tags: p.tags,
                origin: p.origin,
            })
            .collect(),
    }
}

/// Run discovery and one round of pings. Returns what every context saw.
pub fn run_simulation(
    config: &CourierConfig,
    args: &SimulateArgs,
) -> CourierResult<SimulationReport> {
    let net = MemoryNetwork::new();
    net.set_channels_enabled(!args.no_channels);

    let root = net.add_root(HOST_ORIGIN);
    let host = net.transport(root);
    let mut couriers: BTreeMap<WindowId, (Courier, String)> = BTreeMap::new();
    couriers.insert(
        root,
        (
            Courier::builder(config.clone(), host.clone())
                .frame_host(host)
                .build()?,
            HOST_ORIGIN.to_string(),
        ),
    );
    for n in 1..=args.frames {
        let origin = format!("https://frame-{n}.example");
        let window = net.add_frame(root, &origin, None, &args.tags);
        let courier = Courier::builder(config.clone(), net.transport(window)).build()?;
        couriers.insert(window, (courier, origin));
    }

    let pump = |net: &MemoryNetwork| {
        net.run_until_idle(|target, msg| {
            if let Some((courier, _)) = couriers.get(&target) {
                courier.handle_message(msg);
            }
        })
    };

    for (courier, _) in couriers.values() {
        courier.start();
    }
    let mut deliveries = pump(&net);
    info!(deliveries, frames = args.frames, "Discovery settled");

    for (courier, _) in couriers.values() {
        let own = courier.id().unwrap_or_default();
        courier.listen("ping", move |_, responder| {
            if let Err(e) = responder.respond(json!({ "pong": own }), None) {
                warn!(error = %e, "Failed to answer ping");
            }
        });
    }

    let replies = Arc::new(Mutex::new(Vec::new()));
    if let Some((first, _)) = couriers.iter().find(|(w, _)| **w != root).map(|(_, c)| c) {
        for peer in first.peers() {
            let replies = replies.clone();
            let from = peer.id.clone();
            first.send(
                &peer.id,
                "ping",
                Value::Null,
                Some(listener(move |payload, _| {
                    replies
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(ReplyReport {
                            peer: from.clone(),
                            payload: payload.clone(),
                        });
                })),
            )?;
        }
        deliveries += pump(&net);
    }

    let contexts = couriers
        .values()
        .map(|(courier, origin)| context_report(courier, origin.clone()))
        .collect();
    let replies = std::mem::take(&mut *replies.lock().unwrap_or_else(|e| e.into_inner()));
    Ok(SimulationReport {
        deliveries,
        contexts,
        replies,
    })
}

pub fn cmd_simulate(config: &CourierConfig, args: &SimulateArgs) {
    let report = match run_simulation(config, args) {
        Ok(report) => report,
        Err(e) => {
            ui::error(&format!("Simulation failed: {e}"));
            std::process::exit(1);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                ui::error(&format!("Failed to serialize report: {e}"));
                std::process::exit(1);
            }
        }
        return;
    }

    for context in &report.contexts {
        ui::section(&format!("{} ({})", display_id(&context.id), context.role));
        ui::kv("Origin", &context.origin);
        if !context.tags.is_empty() {
            ui::kv("Tags", &context.tags.join(" "));
        }
        let mut table = Table::new(&["PEER", "TAGS", "ORIGIN", "CHANNEL"]);
        for peer in &context.peers {
            let tags = peer.tags.join(" ");
            table.add_row(&[
                display_id(&peer.id),
                tags.as_str(),
                peer.origin.as_str(),
                peer.channel.as_str(),
            ]);
        }
        table.print();
        ui::blank();
    }

    ui::section("Ping round");
    for reply in &report.replies {
        ui::success(&format!("{} answered {}", display_id(&reply.peer), reply.payload));
    }
    ui::kv("Deliveries", &report.deliveries.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(frames: usize, no_channels: bool) -> SimulateArgs {
        SimulateArgs {
            frames,
            tags: "red blue".into(),
            no_channels,
            json: false,
        }
    }

    #[test]
    fn test_every_context_knows_every_other() {
        let report = run_simulation(&CourierConfig::default(), &args(3, false)).unwrap();
        assert_eq!(report.contexts.len(), 4);

        let root = &report.contexts[0];
        assert_eq!(root.role, "root");
        assert_eq!(root.id, ROOT_ID);
        assert_eq!(root.peers.len(), 4);

        for frame in &report.contexts[1..] {
            assert_eq!(frame.role, "child");
            assert!(frame.id.starts_with("frame-"));
            assert_eq!(frame.tags, vec!["red", "blue"]);
            assert_eq!(frame.peers.len(), 3);
            assert!(frame.peers.iter().all(|p| p.channel == "dedicated"));
        }
    }

    #[test]
    fn test_ping_round_reaches_every_peer() {
        let report = run_simulation(&CourierConfig::default(), &args(3, false)).unwrap();
        let first = &report.contexts[1];
        assert_eq!(report.replies.len(), first.peers.len());
        for reply in &report.replies {
            assert_eq!(reply.payload, json!({ "pong": reply.peer }));
        }
    }

    #[test]
    fn test_shared_transport_without_channels() {
        let report = run_simulation(&CourierConfig::default(), &args(2, true)).unwrap();
        for frame in &report.contexts[1..] {
            assert!(frame.peers.iter().all(|p| p.channel == "shared"));
        }
        assert_eq!(report.replies.len(), 2);
    }

    #[test]
    fn test_no_frames() {
        let report = run_simulation(&CourierConfig::default(), &args(0, false)).unwrap();
        assert_eq!(report.contexts.len(), 1);
        assert!(report.replies.is_empty());
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let config = CourierConfig {
            scope: String::new(),
            ..CourierConfig::default()
        };
        assert!(run_simulation(&config, &args(1, false)).is_err());
    }
}
