//! Socket loop: reads datagrams, drives the server once per tick and writes
//! whatever it produced.

use crate::config::AppConfig;
use crate::region::Region;
use anyhow::{Context, Result};
use simwire_core::CircuitCode;
use simwire_net::Listener;
use simwire_server::Server;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

struct Sockets {
    client: UdpSocket,
    peer: Option<UdpSocket>,
}

impl Sockets {
    async fn bind(config: &AppConfig) -> Result<Self> {
        let client = UdpSocket::bind(config.net.client_bind)
            .await
            .with_context(|| format!("binding client socket {}", config.net.client_bind))?;
        let peer = match config.net.peer_bind {
            Some(addr) => Some(
                UdpSocket::bind(addr)
                    .await
                    .with_context(|| format!("binding peer socket {addr}"))?,
            ),
            None => None,
        };
        Ok(Self { client, peer })
    }

    fn get(&self, listener: Listener) -> Option<&UdpSocket> {
        match listener {
            Listener::Client => Some(&self.client),
            Listener::Peer => self.peer.as_ref(),
        }
    }

    /// Everything already queued on the sockets, up to `limit` per socket.
    fn drain(
        &self,
        buf: &mut [u8],
        limit: usize,
        batch: &mut Vec<(Listener, SocketAddr, Vec<u8>)>,
    ) {
        for listener in [Listener::Client, Listener::Peer] {
            let Some(socket) = self.get(listener) else {
                continue;
            };
            for _ in 0..limit {
                match socket.try_recv_from(buf) {
                    Ok((len, from)) => batch.push((listener, from, buf[..len].to_vec())),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => {
                        // ICMP unreachable surfaces here on some platforms
                        debug!(?listener, %err, "recv failed");
                    }
                }
            }
        }
    }
}

pub async fn run(config: AppConfig, max_ticks: Option<u64>) -> Result<()> {
    let sockets = Sockets::bind(&config).await?;
    let mut server = Server::with_standard_messages(config.server.clone())
        .context("registering standard messages")?;
    let mut region = Region::new(&config.region, config.server.patches_per_side);

    let now = Instant::now();
    for grant in &config.logins {
        server.authorize_circuit(grant.code(), grant.session(), now);
    }
    if sockets.peer.is_some() {
        for peer in &config.peers {
            server.add_trusted_peer(peer.endpoint, CircuitCode(peer.circuit_code), now);
        }
    } else if !config.peers.is_empty() {
        warn!("peers configured without a peer socket; ignoring them");
    }

    info!(
        client = %config.net.client_bind,
        peer = ?config.net.peer_bind,
        tick_hz = config.server.tick_rate_hz,
        region = region.terrain().region().0,
        "listening"
    );

    let mut ticker = interval(config.server.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buf = vec![0u8; config.net.recv_buffer.max(1)];
    let mut batch = Vec::new();
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }

        let now = Instant::now();
        sockets.drain(&mut buf, config.net.max_datagrams_per_tick, &mut batch);
        if !batch.is_empty() {
            server.handle_batch(std::mem::take(&mut batch), now);
        }
        while let Some(event) = server.poll_decoded() {
            region.handle(&mut server, event, now);
        }
        server.tick(now);

        while let Some(datagram) = server.poll_outbound() {
            let Some(socket) = sockets.get(datagram.listener) else {
                continue;
            };
            if let Err(err) = socket.send_to(&datagram.bytes, datagram.endpoint).await {
                debug!(endpoint = %datagram.endpoint, %err, "send failed");
            }
        }

        ticks += 1;
        if max_ticks.is_some_and(|max| ticks >= max) {
            break;
        }
    }

    let stats = server.stats();
    info!(
        ticks,
        stats = %serde_json::to_string(&stats).context("serializing stats")?,
        "stopped"
    );
    Ok(())
}
