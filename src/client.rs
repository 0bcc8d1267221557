use std::sync::atomic::{self, AtomicU64};

use crate::{
    broadcast::LedgerEvent,
    ledger::{LedgerError, Outcome},
    protocol::{Action, Request, Response},
    Shared,
};

static NEW_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("admin authentication failed")]
    AuthenticationFailure,

    #[error("winning number {number} is outside of {min}..={max}")]
    InvalidWinningNumber { number: i64, min: i64, max: i64 },

    #[error("no winning number has been set")]
    NoWinningNumber,

    #[error("{0}")]
    Ledger(#[from] LedgerError),
}

/// The session of a single connected client
pub struct Client {
    id: u64,
    // set once the client proved it knows the admin password
    admin: bool,
    state: Shared,
}

impl Client {
    pub fn new(state: Shared) -> Client {
        Self {
            id: NEW_CLIENT_ID.fetch_add(1, atomic::Ordering::SeqCst),
            admin: false,
            state,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Handles a single request line
    ///
    /// never fails, protocol and business errors are turned into an error response.
    pub fn handle_request(&mut self, line: impl AsRef<[u8]>) -> Response {
        let request = match Request::decode_bytes(line.as_ref()) {
            Ok(request) => request,
            Err(err) => {
                self.state
                    .log_event(&format!("client {} sent a bad request: {}", self.id, err));
                return Response::error(err.to_string());
            }
        };

        let action = request.action;
        let username = request.username.clone().unwrap_or_else(|| "-".into());

        let response = self
            .dispatch(request)
            .unwrap_or_else(|err| Response::error(err.to_string()));

        self.state.log_event(&format!(
            "client {} {} {} -> {:?}: {}",
            self.id, action, username, response.status, response.message
        ));

        response
    }

    fn dispatch(&mut self, request: Request) -> Result<Response, RequestError> {
        match request.action {
            Action::Login => self.login(request),
            Action::BuyTicket => self.buy_ticket(request),
            Action::CheckResult => self.check_result(request),
            Action::AdminLogin => self.admin_login(request),
            Action::SetWinningNumber => self.set_winning_number(request),
            Action::ViewTickets => self.view_tickets(request),
            Action::AnnounceResults => self.announce_results(request),
        }
    }

    fn login(&mut self, request: Request) -> Result<Response, RequestError> {
        let username = required(request.username, "username")?;
        let balance = self.state.ledger.ensure_user(&username);

        Ok(Response::success("login successful").with_balance(balance))
    }

    fn buy_ticket(&mut self, request: Request) -> Result<Response, RequestError> {
        let username = required(request.username, "username")?;
        let policy = &self.state.policy;

        let purchase = self.state.ledger.purchase_ticket(
            &username,
            policy.price,
            policy.number_count,
            policy.number_range.clone(),
        )?;

        let broadcaster = &self.state.broadcaster;
        broadcaster.broadcast(LedgerEvent::ticket_purchased(
            username,
            purchase.ticket.id,
            purchase.ticket.numbers.clone(),
        ));
        broadcaster.broadcast(LedgerEvent::ticket_count(self.state.ledger.ticket_count()));

        Ok(Response::success("ticket purchased")
            .with_ticket(&purchase.ticket)
            .with_balance(purchase.balance))
    }

    fn check_result(&mut self, request: Request) -> Result<Response, RequestError> {
        let username = required(request.username, "username")?;

        let response = match self.state.ledger.evaluate_result(&username)? {
            Outcome::Won => Response::success("congratulations, you won").with_won(true),
            Outcome::NotWon => Response::success("you did not win").with_won(false),
        };

        Ok(response)
    }

    fn admin_login(&mut self, request: Request) -> Result<Response, RequestError> {
        let password = required(request.password, "password")?;
        if password != self.state.admin_password {
            return Err(RequestError::AuthenticationFailure);
        }

        self.admin = true;
        Ok(Response::success("admin login successful"))
    }

    fn set_winning_number(&mut self, request: Request) -> Result<Response, RequestError> {
        self.authorize(request.password.as_deref())?;
        let number = request
            .winning_number
            .ok_or(RequestError::MissingField("winningNumber"))?;

        let range = &self.state.policy.number_range;
        if !range.contains(&number) {
            return Err(RequestError::InvalidWinningNumber {
                number,
                min: *range.start(),
                max: *range.end(),
            });
        }

        self.state.ledger.set_winning_number(number);
        self.state
            .broadcaster
            .broadcast(LedgerEvent::winning_number(number));

        Ok(Response::success(format!("winning number set to {}", number))
            .with_winning_number(number))
    }

    fn view_tickets(&mut self, request: Request) -> Result<Response, RequestError> {
        let tickets = match request.username.filter(|username| !username.is_empty()) {
            Some(username) => self.state.ledger.list_user_tickets(&username)?,
            None => self.state.ledger.list_all_tickets(),
        };

        Ok(Response::success(format!("{} tickets", tickets.len())).with_tickets(tickets))
    }

    fn announce_results(&mut self, request: Request) -> Result<Response, RequestError> {
        self.authorize(request.password.as_deref())?;
        let number = self
            .state
            .ledger
            .winning_number()
            .ok_or(RequestError::NoWinningNumber)?;

        let winners = self.state.ledger.winners(number);
        let viewers = self
            .state
            .broadcaster
            .broadcast(LedgerEvent::results_announced(number, winners.clone()));

        Ok(
            Response::success(format!("results announced to {} viewers", viewers))
                .with_winning_number(number)
                .with_winners(winners),
        )
    }

    // admin actions are allowed after an admin login, or with the password attached
    fn authorize(&self, password: Option<&str>) -> Result<(), RequestError> {
        match password {
            _ if self.admin => Ok(()),
            Some(password) if password == self.state.admin_password => Ok(()),
            _ => Err(RequestError::AuthenticationFailure),
        }
    }
}

fn required(field: Option<String>, name: &'static str) -> Result<String, RequestError> {
    field
        .filter(|value| !value.is_empty())
        .ok_or(RequestError::MissingField(name))
}
