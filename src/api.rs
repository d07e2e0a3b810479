use chrono::NaiveDate;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use ulid::Ulid;

use crate::model::*;

/// One request line: `{"id", "actor", "method", "path", "body"}`.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub actor: Actor,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Value,
}

/// Parsed command from a request's method, path and body.
#[derive(Debug, PartialEq)]
pub enum Command {
    RequestBooking { slot_id: Ulid, load_type: LoadType },
    CancelBooking { id: Ulid },
    UpdateBookingStatus { id: Ulid, status: BookingStatus },
    ListBookings { filter: BookingFilter },
    CheckIn { ticket_id: Ulid },
    ListSlots { date: Option<NaiveDate>, pair_id: Option<PairId> },
    SetSlotEnabled { id: Ulid, enabled: bool },
    DeleteSlot { id: Ulid },
    RegenerateSlots { days: Option<u32> },
    JoinWaitlist { slot_id: Ulid, load_type: LoadType },
    ListWaitlist,
    LeaveWaitlist { id: Ulid },
    ListMachines { pair_id: Option<PairId> },
    SetMachineStatus { id: Ulid, status: MachineStatus },
    Listen,
}

#[derive(Deserialize)]
struct LoadBody {
    slot_id: Ulid,
    load_type: LoadType,
}

#[derive(Deserialize)]
struct StatusBody {
    status: String,
}

#[derive(Deserialize)]
struct MachineBody {
    status: MachineStatus,
}

#[derive(Deserialize, Default)]
struct RegenerateBody {
    days: Option<u32>,
}

pub fn parse_request(method: &str, path: &str, body: &Value) -> Result<Command, ParseError> {
    let (route, query) = path.split_once('?').unwrap_or((path, ""));
    let segments: Vec<&str> = route.trim_matches('/').split('/').collect();
    let params = parse_query(query)?;
    let method = method.to_ascii_uppercase();

    match (method.as_str(), segments.as_slice()) {
        ("POST", ["bookings"]) => {
            let b: LoadBody = parse_body(body)?;
            Ok(Command::RequestBooking {
                slot_id: b.slot_id,
                load_type: b.load_type,
            })
        }
        ("GET", ["bookings"]) => Ok(Command::ListBookings {
            filter: BookingFilter {
                user_id: query_value(&params, "user_id")?,
                status: query_value(&params, "status")?,
                date: query_value(&params, "date")?,
            },
        }),
        ("DELETE", ["bookings", id]) => Ok(Command::CancelBooking { id: parse_id(id)? }),
        ("PUT", ["bookings", id]) => {
            let b: StatusBody = parse_body(body)?;
            let status = b.status.parse().map_err(ParseError::BadBody)?;
            Ok(Command::UpdateBookingStatus {
                id: parse_id(id)?,
                status,
            })
        }
        ("POST", ["tickets", ticket, "check-in"]) => Ok(Command::CheckIn {
            ticket_id: parse_id(ticket)?,
        }),
        ("GET", ["timeslots"]) => Ok(Command::ListSlots {
            date: query_value(&params, "date")?,
            pair_id: query_value(&params, "pair_id")?,
        }),
        ("PUT", ["timeslots", id, toggle @ ("enable" | "disable")]) => Ok(Command::SetSlotEnabled {
            id: parse_id(id)?,
            enabled: *toggle == "enable",
        }),
        ("DELETE", ["timeslots", id]) => Ok(Command::DeleteSlot { id: parse_id(id)? }),
        ("POST", ["admin", "regenerate-slots"]) => {
            let b: RegenerateBody = if body.is_null() {
                RegenerateBody::default()
            } else {
                parse_body(body)?
            };
            Ok(Command::RegenerateSlots { days: b.days })
        }
        ("POST", ["waitlist"]) => {
            let b: LoadBody = parse_body(body)?;
            Ok(Command::JoinWaitlist {
                slot_id: b.slot_id,
                load_type: b.load_type,
            })
        }
        ("GET", ["waitlist"]) => Ok(Command::ListWaitlist),
        ("DELETE", ["waitlist", id]) => Ok(Command::LeaveWaitlist { id: parse_id(id)? }),
        ("GET", ["machines"]) => Ok(Command::ListMachines {
            pair_id: query_value(&params, "pair_id")?,
        }),
        ("PUT", ["machines", id]) => {
            let b: MachineBody = parse_body(body)?;
            Ok(Command::SetMachineStatus {
                id: parse_id(id)?,
                status: b.status,
            })
        }
        ("LISTEN", ["notifications"]) => Ok(Command::Listen),
        _ => Err(ParseError::UnknownRoute(format!("{method} {route}"))),
    }
}

fn parse_id(raw: &str) -> Result<Ulid, ParseError> {
    Ulid::from_string(raw).map_err(|_| ParseError::BadId(raw.to_string()))
}

fn parse_body<T: DeserializeOwned>(body: &Value) -> Result<T, ParseError> {
    T::deserialize(body).map_err(|e| ParseError::BadBody(e.to_string()))
}

fn parse_query(query: &str) -> Result<Vec<(&str, &str)>, ParseError> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .ok_or_else(|| ParseError::BadQuery(format!("expected key=value, got {pair:?}")))
        })
        .collect()
}

/// Optional typed query parameter. An empty value counts as absent.
fn query_value<T: std::str::FromStr>(params: &[(&str, &str)], key: &str) -> Result<Option<T>, ParseError> {
    match params.iter().find(|(k, _)| *k == key) {
        None | Some((_, "")) => Ok(None),
        Some((_, raw)) => raw
            .parse()
            .map(Some)
            .map_err(|_| ParseError::BadQuery(format!("invalid {key}: {raw:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum ParseError {
    Malformed(String),
    UnknownRoute(String),
    BadId(String),
    BadQuery(String),
    BadBody(String),
}

impl ParseError {
    /// Wire status and code for this error.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            ParseError::UnknownRoute(_) => (404, "NOT_FOUND"),
            _ => (400, "VALIDATION_ERROR"),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Malformed(s) => write!(f, "malformed request: {s}"),
            ParseError::UnknownRoute(r) => write!(f, "no such route: {r}"),
            ParseError::BadId(id) => write!(f, "invalid id: {id}"),
            ParseError::BadQuery(s) => write!(f, "bad query string: {s}"),
            ParseError::BadBody(s) => write!(f, "bad body: {s}"),
        }
    }
}

impl std::error::Error for ParseError {}
