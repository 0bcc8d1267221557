use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};

use crate::ledger::Ticket;

/// The longest request line accepted, newline excluded
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

// sent when a response can't be serialized, should never happen for well-formed values
const ENCODE_FAILURE_LINE: &str = "{\"status\":\"error\",\"message\":\"internal error\"}\n";

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("malformed message: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("malformed message: request exceeds {MAX_REQUEST_SIZE} bytes")]
    TooLong,

    #[error("unknown action: {0}")]
    UnknownAction(String),
}

/// The closed set of actions a client may invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Login,
    BuyTicket,
    CheckResult,
    AdminLogin,
    SetWinningNumber,
    ViewTickets,
    AnnounceResults,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Login,
        Action::BuyTicket,
        Action::CheckResult,
        Action::AdminLogin,
        Action::SetWinningNumber,
        Action::ViewTickets,
        Action::AnnounceResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Login => "login",
            Action::BuyTicket => "buyTicket",
            Action::CheckResult => "checkResult",
            Action::AdminLogin => "adminLogin",
            Action::SetWinningNumber => "setWinningNumber",
            Action::ViewTickets => "viewTickets",
            Action::AnnounceResults => "announceResults",
        }
    }
}

impl FromStr for Action {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownAction(s.into()))
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winning_number: Option<i64>,
}

// the action is kept as a plain string on the wire,
// so an unknown action can be told apart from a malformed line
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequest {
    action: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    winning_number: Option<i64>,
}

impl Request {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            username: None,
            password: None,
            winning_number: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_winning_number(mut self, number: i64) -> Self {
        self.winning_number = Some(number);
        self
    }

    /// Decodes a single line into a request
    ///
    /// a line that isn't a JSON object of the expected shape is malformed,
    /// a well-formed line naming an action we don't know is rejected with `UnknownAction`.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let raw: RawRequest = serde_json::from_str(line.trim_end())?;

        Ok(Self {
            action: raw.action.parse()?,
            username: raw.username,
            password: raw.password,
            winning_number: raw.winning_number,
        })
    }

    /// Decodes a raw line as read from the socket
    ///
    /// lines longer than `MAX_REQUEST_SIZE` or not valid UTF-8 are malformed.
    pub fn decode_bytes(line: &[u8]) -> Result<Self, DecodeError> {
        if line.strip_suffix(b"\n").unwrap_or(line).len() > MAX_REQUEST_SIZE {
            return Err(DecodeError::TooLong);
        }

        Self::decode(std::str::from_utf8(line)?)
    }

    pub fn encode(&self) -> String {
        encode_line(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_numbers: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winning_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub won: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tickets: Option<Vec<Ticket>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winners: Option<Vec<String>>,
}

impl Response {
    fn new(status: Status, message: String) -> Self {
        Self {
            status,
            message,
            balance: None,
            ticket_id: None,
            ticket_numbers: None,
            winning_number: None,
            won: None,
            tickets: None,
            winners: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(Status::Success, message.into())
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(Status::Error, reason.into())
    }

    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance = Some(balance);
        self
    }

    pub fn with_ticket(mut self, ticket: &Ticket) -> Self {
        self.ticket_id = Some(ticket.id);
        self.ticket_numbers = Some(ticket.numbers.clone());
        self
    }

    pub fn with_winning_number(mut self, number: i64) -> Self {
        self.winning_number = Some(number);
        self
    }

    pub fn with_won(mut self, won: bool) -> Self {
        self.won = Some(won);
        self
    }

    pub fn with_tickets(mut self, tickets: Vec<Ticket>) -> Self {
        self.tickets = Some(tickets);
        self
    }

    pub fn with_winners(mut self, winners: Vec<String>) -> Self {
        self.winners = Some(winners);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// Encodes the response as a single newline-terminated line
    pub fn encode(&self) -> String {
        encode_line(self)
    }
}

fn encode_line<T: Serialize>(message: &T) -> String {
    match serde_json::to_string(message) {
        Ok(mut line) => {
            line.push('\n');
            line
        }
        Err(err) => {
            tracing::error!("failed to encode message: {}", err);
            ENCODE_FAILURE_LINE.into()
        }
    }
}
