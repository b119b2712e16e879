use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{
    Command, ConnectionEvent, ConnectionState, Frame, Inner, Transport, NORMAL_CLOSURE,
};
use crate::envelope::{Envelope, PING, PONG};
use crate::error::NetError;

enum SessionEnd {
    Stopped,
    Closed(Option<u16>),
    Failed(NetError),
}

enum Next {
    Retry,
    Stop,
    Abandon(u32),
}

pub(super) async fn run(
    inner: Arc<Inner>,
    generation: u64,
    stop: CancellationToken,
    mut commands: mpsc::UnboundedReceiver<Command>,
    retry_now: Arc<Notify>,
) {
    let endpoint = inner.endpoint.clone();
    loop {
        inner.set_state(ConnectionState::Connecting);
        let attempt = tokio::select! {
            biased;
            _ = stop.cancelled() => Err(NetError::Aborted),
            result = inner.connector.connect(&endpoint) => result,
        };

        match attempt {
            Ok(mut transport) => {
                inner.attempts.store(0, Ordering::Relaxed);
                let session = inner.sessions.fetch_add(1, Ordering::Relaxed) + 1;
                inner.set_state(ConnectionState::Connected);
                log::info!("connection: connected endpoint={endpoint} session={session}");
                inner.emit(ConnectionEvent::Connected { session });
                resubscribe(&inner, transport.as_mut()).await;

                let end = run_session(&inner, transport.as_mut(), &stop, &mut commands).await;
                reject_pending(&mut commands);
                match end {
                    SessionEnd::Stopped => {
                        if let Err(err) = transport.close(NORMAL_CLOSURE).await {
                            log::debug!("connection: close failed endpoint={endpoint} err={err}");
                        }
                        inner.emit(ConnectionEvent::Disconnected { code: Some(NORMAL_CLOSURE) });
                        return;
                    }
                    SessionEnd::Closed(Some(NORMAL_CLOSURE)) => {
                        log::info!("connection: closed normally by peer endpoint={endpoint}");
                        inner.release(generation);
                        inner.set_state(ConnectionState::Disconnected);
                        inner.emit(ConnectionEvent::Disconnected { code: Some(NORMAL_CLOSURE) });
                        return;
                    }
                    SessionEnd::Closed(code) => {
                        log::warn!("connection: lost endpoint={endpoint} code={code:?}");
                        inner.emit(ConnectionEvent::Disconnected { code });
                    }
                    SessionEnd::Failed(error) => {
                        log::warn!("connection: transport failed endpoint={endpoint} err={error}");
                        inner.emit(ConnectionEvent::Error { error });
                        inner.emit(ConnectionEvent::Disconnected { code: None });
                    }
                }
            }
            Err(NetError::Aborted) if stop.is_cancelled() => {
                inner.emit(ConnectionEvent::ConnectFailed { error: NetError::Aborted });
                return;
            }
            Err(error) => {
                log::warn!("connection: connect failed endpoint={endpoint} err={error}");
                if !inner.config.auto_reconnect {
                    inner.release(generation);
                    inner.set_state(ConnectionState::Disconnected);
                    inner.emit(ConnectionEvent::ConnectFailed { error });
                    return;
                }
                inner.set_state(ConnectionState::Disconnected);
                inner.emit(ConnectionEvent::ConnectFailed { error });
            }
        }

        if !inner.config.auto_reconnect {
            inner.release(generation);
            inner.set_state(ConnectionState::Disconnected);
            return;
        }
        inner.set_state(ConnectionState::Disconnected);
        match wait_for_retry(&inner, &stop, &retry_now).await {
            Next::Retry => {}
            Next::Stop => return,
            Next::Abandon(attempts) => {
                log::warn!("connection: abandoned endpoint={endpoint} attempts={attempts}");
                inner.release(generation);
                inner.emit(ConnectionEvent::Abandoned { attempts });
                return;
            }
        }
    }
}

/// Waits out the backoff delay for the next reconnect attempt and counts it.
///
/// Offline time is not counted; coming back online skips the remaining delay.
async fn wait_for_retry(inner: &Inner, stop: &CancellationToken, retry_now: &Notify) -> Next {
    let mut network = inner.network.clone();
    let mut watching = true;
    loop {
        if watching && !*network.borrow_and_update() {
            log::info!("connection: offline, reconnect suspended endpoint={}", inner.endpoint);
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Next::Stop,
                _ = retry_now.notified() => return Next::Retry,
                changed = network.changed() => {
                    if changed.is_err() {
                        watching = false;
                    } else if *network.borrow_and_update() {
                        log::info!("connection: back online endpoint={}", inner.endpoint);
                        return count_attempt(inner);
                    }
                    continue;
                }
            }
        }

        let attempts = inner.attempts.load(Ordering::Relaxed);
        if attempts >= inner.config.max_reconnect_attempts {
            return Next::Abandon(attempts);
        }
        let delay = inner.backoff.delay(
            attempts,
            inner.config.reconnect_base_delay(),
            inner.config.reconnect_max_delay(),
        );
        log::info!(
            "connection: reconnect scheduled endpoint={} attempt={} delay_ms={}",
            inner.endpoint,
            attempts + 1,
            delay.as_millis()
        );
        inner.emit(ConnectionEvent::ReconnectScheduled { attempt: attempts + 1, delay });

        tokio::select! {
            biased;
            _ = stop.cancelled() => return Next::Stop,
            _ = retry_now.notified() => {}
            changed = network.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                }
                // Offline now: loop back and suspend without counting.
                continue;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        return count_attempt(inner);
    }
}

fn count_attempt(inner: &Inner) -> Next {
    let attempts = inner.attempts.load(Ordering::Relaxed);
    if attempts >= inner.config.max_reconnect_attempts {
        return Next::Abandon(attempts);
    }
    inner.attempts.store(attempts + 1, Ordering::Relaxed);
    Next::Retry
}

async fn run_session(
    inner: &Inner,
    transport: &mut dyn Transport,
    stop: &CancellationToken,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let mut heartbeat = inner.config.heartbeat_interval().map(|period| {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return SessionEnd::Stopped,
            Some(command) = commands.recv() => match command {
                Command::Send { text, reply } => {
                    let delivered = match transport.send_text(text).await {
                        Ok(()) => true,
                        Err(err) => {
                            log::warn!("connection: send failed endpoint={} err={err}", inner.endpoint);
                            false
                        }
                    };
                    let _ = reply.send(delivered);
                }
            },
            _ = next_tick(&mut heartbeat) => {
                log::trace!("connection: heartbeat endpoint={}", inner.endpoint);
                send_envelope(inner, transport, &Envelope::ping()).await;
            }
            frame = transport.next_frame() => match frame {
                Some(Ok(Frame::Text(text))) => handle_text(inner, transport, &text).await,
                Some(Ok(Frame::Close(code))) => return SessionEnd::Closed(code),
                Some(Err(err)) => return SessionEnd::Failed(err),
                None => return SessionEnd::Closed(None),
            },
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn handle_text(inner: &Inner, transport: &mut dyn Transport, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(error) => {
            log::warn!("connection: undecodable frame endpoint={} err={error}", inner.endpoint);
            inner.emit(ConnectionEvent::Error { error });
            return;
        }
    };
    match envelope.kind.as_str() {
        PING => send_envelope(inner, transport, &Envelope::pong()).await,
        PONG => inner.record_pong(),
        _ => {
            let topic = envelope.kind.clone();
            inner.registry().dispatch(&topic, envelope);
        }
    }
}

async fn send_envelope(inner: &Inner, transport: &mut dyn Transport, envelope: &Envelope) {
    let text = match envelope.encode() {
        Ok(text) => text,
        Err(err) => {
            log::warn!("connection: unencodable envelope kind={} err={err}", envelope.kind);
            return;
        }
    };
    if let Err(err) = transport.send_text(text).await {
        log::warn!("connection: send failed endpoint={} kind={} err={err}", inner.endpoint, envelope.kind);
    }
}

async fn resubscribe(inner: &Inner, transport: &mut dyn Transport) {
    let replay = inner.registry().remote_subscriptions();
    if !replay.is_empty() {
        log::debug!("connection: resubscribing endpoint={} count={}", inner.endpoint, replay.len());
    }
    for envelope in &replay {
        send_envelope(inner, transport, envelope).await;
    }
}

/// Answers queued sends from a session that has ended.
fn reject_pending(commands: &mut mpsc::UnboundedReceiver<Command>) {
    while let Ok(Command::Send { reply, .. }) = commands.try_recv() {
        let _ = reply.send(false);
    }
}
