//! Accept loop and per-connection MQTT session handling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use tokio::time::Instant;

use crate::auth::{AllowAll, Authenticator};
use crate::broker::{Broker, MemoryRetained, RetainedStore, Session, SessionPhase};
use crate::config::Config;
use crate::net::{BoxedIo, ConnInfo, Established, Listener, MqttStream, TransportError};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, Qos, SubAck, SubscribeReturnCode,
};
use crate::routing::{Filter, Topic};

static ANON_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Shared collaborators handed to every connection task.
#[derive(Clone)]
pub struct ServerCtx {
    pub broker: Broker,
    pub auth: Arc<dyn Authenticator>,
    pub retained: Arc<dyn RetainedStore>,
}

impl ServerCtx {
    pub fn new(
        broker: Broker,
        auth: Arc<dyn Authenticator>,
        retained: Arc<dyn RetainedStore>,
    ) -> Self {
        ServerCtx {
            broker,
            auth,
            retained,
        }
    }
}

/// Bind every configured listener and serve until interrupted.
pub async fn run(config: Config) -> Result<()> {
    let broker = Broker::with_limits(config.limits);
    let ctx = ServerCtx::new(
        broker,
        Arc::new(AllowAll),
        Arc::new(MemoryRetained::new()),
    );
    let mut accept_tasks = Vec::new();
    for listener_cfg in &config.listeners {
        let listener = Listener::bind(listener_cfg).await?;
        accept_tasks.push(tokio::spawn(serve(listener, ctx.clone())));
    }
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    for task in accept_tasks {
        task.abort();
    }
    Ok(())
}

/// Accept connections forever. Only the raw TCP accept runs here; each
/// connection's handshake and packet loop get their own task, so a slow
/// TLS or WebSocket handshake never stalls acceptance.
pub async fn serve(listener: Listener, ctx: ServerCtx) {
    loop {
        let pending = match listener.accept().await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!("accept error: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let peer = pending.peer_addr();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let established = match pending.establish().await {
                Ok(established) => established,
                Err(err) => {
                    tracing::warn!(%peer, "handshake failed: {err}");
                    return;
                }
            };
            if let Err(err) = handle_connection(established, ctx).await {
                tracing::warn!(%peer, "connection error: {err:#}");
            }
        });
    }
}

/// Drive one established connection to completion. Transport errors are
/// fatal for this connection only; a peer that simply went away is not an
/// error worth reporting.
pub async fn handle_connection(conn: Established, ctx: ServerCtx) -> Result<()> {
    let mut stream = MqttStream::new(conn.io);
    let result = run_connection(&mut stream, &conn.info, &ctx).await;
    let _ = stream.shutdown().await;
    match result {
        Err(err) if is_peer_close(&err) => {
            tracing::debug!(peer = %conn.info.peer_addr, "peer closed the connection");
            Ok(())
        }
        other => other,
    }
}

async fn run_connection(
    stream: &mut MqttStream<BoxedIo>,
    info: &ConnInfo,
    ctx: &ServerCtx,
) -> Result<()> {
    let connect = match stream.read_packet().await? {
        Packet::Connect(connect) => connect,
        other => bail!("expected CONNECT, got {}", other.kind()),
    };
    if connect.protocol_name != "MQTT" || connect.protocol_level != 4 {
        return refuse(stream, ConnectReturnCode::UnacceptableProtocol).await;
    }
    let client_id = if connect.client_id.is_empty() {
        if !connect.clean_session {
            return refuse(stream, ConnectReturnCode::IdentifierRejected).await;
        }
        format!("anon-{}", ANON_COUNTER.fetch_add(1, Ordering::Relaxed))
    } else {
        connect.client_id.clone()
    };
    let identity = match ctx
        .auth
        .authenticate(connect.username.as_deref(), connect.password.as_deref())
    {
        Ok(identity) => identity,
        Err(err) => {
            tracing::warn!(peer = %info.peer_addr, %client_id, "connect rejected: {err}");
            return refuse(stream, err.return_code()).await;
        }
    };

    // Acknowledge before registering: a CONNACK write failure must not
    // leave an orphaned entry in the session registry.
    stream
        .write_packet(&Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        }))
        .await?;
    stream.flush().await?;
    let session = ctx.broker.create_session();
    tracing::info!(
        peer = %info.peer_addr,
        %client_id,
        key = %session.key(),
        username = ?identity.username,
        tls_peer_certs = info.peer_certificates.len(),
        websocket = info.upgrade_request.is_some(),
        "session connected"
    );

    let result = session_loop(stream, &session, ctx, &connect).await;
    session.close();
    if result.is_err() {
        publish_will(ctx, &connect);
    }
    result
}

async fn refuse(stream: &mut MqttStream<BoxedIo>, code: ConnectReturnCode) -> Result<()> {
    stream
        .write_packet(&Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        }))
        .await?;
    stream.flush().await?;
    Ok(())
}

enum SessionAction {
    Continue,
    Disconnect,
}

async fn session_loop(
    stream: &mut MqttStream<BoxedIo>,
    session: &Arc<Session>,
    ctx: &ServerCtx,
    connect: &Connect,
) -> Result<()> {
    let mut next_mid: u16 = 1;
    // Keep-alive window is 1.5x the negotiated interval.
    let window =
        (connect.keep_alive > 0).then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500));
    let mut deadline = window.map(|w| Instant::now() + w);
    loop {
        let idle = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            packet = stream.read_packet() => {
                let packet = packet?;
                if let Some(w) = window {
                    deadline = Some(Instant::now() + w);
                }
                tracing::debug!(key = %session.key(), kind = packet.kind(), "packet received");
                match handle_packet(stream, session, ctx, packet).await? {
                    SessionAction::Continue => {}
                    SessionAction::Disconnect => return Ok(()),
                }
            }
            _ = session.outbound_ready() => {
                drain_outbound(stream, session, &mut next_mid).await?;
                if session.is_poisoned() {
                    bail!("outbound queue overflow above QoS 0");
                }
                if session.phase() != SessionPhase::Open {
                    return Ok(());
                }
            }
            _ = idle => {
                bail!("keep-alive window expired");
            }
        }
    }
}

async fn handle_packet(
    stream: &mut MqttStream<BoxedIo>,
    session: &Arc<Session>,
    ctx: &ServerCtx,
    packet: Packet,
) -> Result<SessionAction> {
    match packet {
        Packet::Publish(publish) => {
            let topic = Topic::parse(&publish.topic)
                .map_err(|err| anyhow!("{err} in PUBLISH: {:?}", publish.topic))?;
            apply_publish(ctx, &topic, &publish.payload, publish.retain);
            match publish.qos {
                Qos::AtMostOnce => {}
                Qos::AtLeastOnce => {
                    if let Some(mid) = publish.packet_id {
                        stream.write_packet(&Packet::PubAck(mid)).await?;
                    }
                }
                Qos::ExactlyOnce => {
                    if let Some(mid) = publish.packet_id {
                        stream.write_packet(&Packet::PubRec(mid)).await?;
                    }
                }
            }
        }
        Packet::Subscribe(subscribe) => {
            let mut codes = Vec::with_capacity(subscribe.filters.len());
            let mut granted = Vec::new();
            for (raw, qos) in &subscribe.filters {
                match Filter::parse(raw) {
                    Ok(filter) => {
                        granted.push((filter, *qos));
                        codes.push(SubscribeReturnCode::Granted(*qos));
                    }
                    Err(err) => {
                        tracing::debug!(key = %session.key(), filter = ?raw, "{err}");
                        codes.push(SubscribeReturnCode::Failure);
                    }
                }
            }
            if !granted.is_empty() && !session.subscribe(&granted) {
                codes = vec![SubscribeReturnCode::Failure; codes.len()];
            } else {
                for (filter, _) in &granted {
                    for (topic, payload) in ctx.retained.matching(filter) {
                        session.deliver(&topic, payload);
                    }
                }
            }
            stream
                .write_packet(&Packet::SubAck(SubAck {
                    packet_id: subscribe.packet_id,
                    codes,
                }))
                .await?;
        }
        Packet::Unsubscribe(unsubscribe) => {
            let filters: Vec<Filter> = unsubscribe
                .filters
                .iter()
                .filter_map(|raw| Filter::parse(raw).ok())
                .collect();
            session.unsubscribe(&filters);
            stream
                .write_packet(&Packet::UnsubAck(unsubscribe.packet_id))
                .await?;
        }
        Packet::PubRel(mid) => {
            stream.write_packet(&Packet::PubComp(mid)).await?;
        }
        Packet::PubRec(mid) => {
            stream.write_packet(&Packet::PubRel(mid)).await?;
        }
        Packet::PubAck(_) | Packet::PubComp(_) => {}
        Packet::PingReq => {
            stream.write_packet(&Packet::PingResp).await?;
        }
        Packet::Disconnect => return Ok(SessionAction::Disconnect),
        Packet::Connect(_) => bail!("duplicate CONNECT"),
        Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
            bail!("client sent a server-only packet: {}", packet.kind())
        }
    }
    stream.flush().await?;
    Ok(SessionAction::Continue)
}

async fn drain_outbound(
    stream: &mut MqttStream<BoxedIo>,
    session: &Arc<Session>,
    next_mid: &mut u16,
) -> Result<()> {
    let mut wrote = false;
    while let Some((topic, payload, qos)) = session.pop_outbound() {
        let packet_id = match qos {
            Qos::AtMostOnce => None,
            _ => {
                let mid = *next_mid;
                *next_mid = if mid == u16::MAX { 1 } else { mid + 1 };
                Some(mid)
            }
        };
        stream
            .write_packet(&Packet::Publish(Publish {
                topic: topic.to_string(),
                payload,
                qos,
                packet_id,
                dup: false,
                retain: false,
            }))
            .await?;
        wrote = true;
    }
    if wrote {
        stream.flush().await?;
    }
    Ok(())
}

fn apply_publish(ctx: &ServerCtx, topic: &Topic, payload: &Bytes, retain: bool) {
    if retain {
        if payload.is_empty() {
            ctx.retained.clear(topic);
        } else {
            ctx.retained.store(topic, payload.clone());
        }
    }
    ctx.broker.publish(topic, payload.clone());
}

fn publish_will(ctx: &ServerCtx, connect: &Connect) {
    if let Some(will) = &connect.will {
        match Topic::parse(&will.topic) {
            Ok(topic) => {
                tracing::debug!(%topic, "publishing will");
                apply_publish(ctx, &topic, &will.payload, will.retain);
            }
            Err(err) => tracing::warn!(topic = ?will.topic, "skipping will: {err}"),
        }
    }
}

fn is_peer_close(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if matches!(
            cause.downcast_ref::<TransportError>(),
            Some(TransportError::Closed)
        ) {
            return true;
        }
        cause
            .downcast_ref::<std::io::Error>()
            .map(|io_err| {
                matches!(
                    io_err.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::BrokenPipe
                )
            })
            .unwrap_or(false)
    })
}
