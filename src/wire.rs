use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::api::{self, Command, ParseError, Request};
use crate::engine::{BookingRequest, Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;

/// One response line: `{"id", "status", "body"}`.
#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Value,
    pub status: u16,
    pub body: Value,
}

/// Pushed notification line for listening connections.
#[derive(Serialize)]
struct Push<'a> {
    event: &'a Event,
}

/// Status code plus JSON body, before the request id is attached.
#[derive(Debug, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    fn new<T: Serialize>(status: u16, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status, body },
            Err(e) => error_reply(500, "INTERNAL", e.to_string()),
        }
    }

    fn no_content() -> Self {
        Self {
            status: 204,
            body: Value::Null,
        }
    }
}

fn error_reply(status: u16, code: &str, message: String) -> Reply {
    Reply {
        status,
        body: json!({ "code": code, "message": message }),
    }
}

pub fn error_status(e: &EngineError) -> u16 {
    match e {
        EngineError::NotFound(_) => 404,
        EngineError::Busy(_) | EngineError::LockBusy(_) => 503,
        EngineError::Validation(_) | EngineError::LimitExceeded(_) => 400,
        EngineError::Forbidden(_) => 403,
        EngineError::WalError(_) => 500,
        EngineError::Conflict(_)
        | EngineError::SlotFull { .. }
        | EngineError::WaitlistFull(_)
        | EngineError::DuplicateBooking(_)
        | EngineError::AlreadyWaiting(_)
        | EngineError::InvalidTransition { .. } => 409,
    }
}

fn engine_err(e: EngineError) -> Reply {
    error_reply(error_status(&e), e.code(), e.to_string())
}

fn parse_err(e: ParseError) -> Reply {
    let (status, code) = e.status();
    error_reply(status, code, e.to_string())
}

/// Run one command against the engine and shape the reply.
pub async fn execute_command(engine: &Engine, actor: &Actor, cmd: Command) -> Reply {
    match run(engine, actor, cmd).await {
        Ok(reply) => reply,
        Err(e) => engine_err(e),
    }
}

async fn run(engine: &Engine, actor: &Actor, cmd: Command) -> Result<Reply, EngineError> {
    let reply = match cmd {
        Command::RequestBooking { slot_id, load_type } => {
            match engine.request_booking(actor, slot_id, load_type).await? {
                BookingRequest::Booked(booking) => Reply::new(201, &booking),
                BookingRequest::Waitlisted(entry) => Reply::new(
                    202,
                    &json!({
                        "waitlist": true,
                        "position": entry.position,
                        "waitlist_id": entry.id,
                    }),
                ),
            }
        }
        Command::CancelBooking { id } => {
            engine.cancel_booking(actor, id).await?;
            Reply::no_content()
        }
        Command::UpdateBookingStatus { id, status } => {
            let outcome = engine.advance_status(actor, id, status).await?;
            Reply::new(200, &outcome.booking)
        }
        Command::ListBookings { filter } => Reply::new(200, &engine.list_bookings(actor, &filter).await?),
        Command::CheckIn { ticket_id } => Reply::new(200, &engine.check_in(actor, ticket_id).await?),
        Command::ListSlots { date, pair_id } => Reply::new(200, &engine.query_slots(date, pair_id).await?),
        Command::SetSlotEnabled { id, enabled } => {
            Reply::new(200, &engine.set_enabled(actor, id, enabled).await?)
        }
        Command::DeleteSlot { id } => {
            engine.delete_slot(actor, id).await?;
            Reply::no_content()
        }
        Command::RegenerateSlots { days } => Reply::new(200, &engine.regenerate(actor, days).await?),
        Command::JoinWaitlist { slot_id, load_type } => {
            Reply::new(201, &engine.join_waitlist(actor, slot_id, load_type).await?)
        }
        Command::ListWaitlist => Reply::new(200, &engine.list_waitlist(actor).await?),
        Command::LeaveWaitlist { id } => {
            engine.leave_waitlist(actor, id).await?;
            Reply::no_content()
        }
        Command::ListMachines { pair_id } => Reply::new(200, &engine.list_machines(pair_id)),
        Command::SetMachineStatus { id, status } => {
            Reply::new(200, &engine.set_machine_status(actor, id, status).await?)
        }
        Command::Listen => Reply::new(200, &json!({ "listening": actor.user_id })),
    };
    Ok(reply)
}

/// Serve one client: a JSON request per line in, a JSON response per line out.
/// After `LISTEN /notifications` the caller's events are pushed as `{"event": ...}`
/// lines between responses.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut events: Option<broadcast::Receiver<Event>> = None;

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let reply = parse_err(ParseError::Malformed(format!(
                            "request line longer than {MAX_LINE_LEN} bytes"
                        )));
                        send(&mut framed, Value::Null, reply).await?;
                        continue;
                    }
                    Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let (id, reply) = handle_line(&engine, &line, &mut events).await;
                send(&mut framed, id, reply).await?;
            }
            event = recv_event(&mut events) => {
                match event {
                    Ok(event) => {
                        let text = serde_json::to_string(&Push { event: &event })?;
                        framed.send(text).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("listener fell behind, {n} notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => events = None,
                }
            }
        }
    }
    Ok(())
}

async fn handle_line(
    engine: &Arc<Engine>,
    line: &str,
    events: &mut Option<broadcast::Receiver<Event>>,
) -> (Value, Reply) {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return (Value::Null, parse_err(ParseError::Malformed(e.to_string()))),
    };
    let cmd = match api::parse_request(&request.method, &request.path, &request.body) {
        Ok(cmd) => cmd,
        Err(e) => return (request.id, parse_err(e)),
    };

    let label = crate::observability::command_label(&cmd);
    let started = Instant::now();
    let actor = request.actor;
    if matches!(cmd, Command::Listen) {
        *events = Some(engine.notify.subscribe(actor.user_id));
    }

    // Run on its own task: if the client goes away mid-request the mutation still completes.
    let task_engine = engine.clone();
    let reply = match tokio::spawn(async move { execute_command(&task_engine, &actor, cmd).await }).await {
        Ok(reply) => reply,
        Err(e) => error_reply(500, "INTERNAL", format!("request task failed: {e}")),
    };

    metrics::counter!(
        crate::observability::REQUESTS_TOTAL,
        "command" => label,
        "status" => reply.status.to_string()
    )
    .increment(1);
    metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "command" => label)
        .record(started.elapsed().as_secs_f64());
    (request.id, reply)
}

async fn send(
    framed: &mut Framed<TcpStream, LinesCodec>,
    id: Value,
    reply: Reply,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let response = Response {
        id,
        status: reply.status,
        body: reply.body,
    };
    framed.send(serde_json::to_string(&response)?).await?;
    Ok(())
}

/// Next pushed event, or pending forever when the connection is not listening.
async fn recv_event(
    events: &mut Option<broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
