use std::{
    collections::BTreeMap,
    ops::RangeInclusive,
    sync::{Mutex, MutexGuard, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The id given to the first ticket ever issued
pub const FIRST_TICKET_ID: u64 = 1001;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: u64,
    #[serde(rename = "username")]
    pub owner: String,
    pub numbers: Vec<i64>,
    pub purchase_time: DateTime<Utc>,
}

impl Ticket {
    pub fn contains(&self, number: i64) -> bool {
        self.numbers.contains(&number)
    }
}

/// A successful purchase, with the buyer's balance right after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Purchase {
    pub ticket: Ticket,
    pub balance: Decimal,
}

#[derive(Debug)]
struct User {
    balance: Decimal,
    // ids of the tickets the user owns, in purchase order
    ticket_ids: Vec<u64>,
}

#[derive(Debug)]
struct TicketTable {
    // maps ticket_id -> Ticket
    tickets: BTreeMap<u64, Ticket>,
    new_ticket_id: u64,
}

impl TicketTable {
    fn issue(&mut self, owner: &str, numbers: Vec<i64>) -> Ticket {
        let id = self.new_ticket_id;
        self.new_ticket_id += 1;

        let ticket = Ticket {
            id,
            owner: owner.into(),
            numbers,
            purchase_time: Utc::now(),
        };
        self.tickets.insert(id, ticket.clone());

        ticket
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("insufficient balance: {balance} available, ticket costs {price}")]
    InsufficientFunds { balance: Decimal, price: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Won,
    NotWon,
}

/// Shared store of users, tickets and the current winning number
///
/// users live in a sharded map, so operations on different usernames don't contend.
/// a purchase holds the buyer's entry for its whole duration, and takes the ticket table
/// lock only to issue the id. the lock order is always user -> ticket table.
#[derive(Debug)]
pub struct Ledger {
    users: DashMap<String, User>,
    tickets: Mutex<TicketTable>,
    winning_number: RwLock<Option<i64>>,
    starting_balance: Decimal,
}

impl Ledger {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            users: DashMap::new(),
            tickets: Mutex::new(TicketTable {
                tickets: BTreeMap::new(),
                new_ticket_id: FIRST_TICKET_ID,
            }),
            winning_number: RwLock::new(None),
            starting_balance,
        }
    }

    /// Creates the user with the starting balance if it doesn't exist yet
    ///
    /// returns the user's current balance, an existing user is never reset.
    pub fn ensure_user(&self, username: &str) -> Decimal {
        self.users
            .entry(username.into())
            .or_insert_with(|| User {
                balance: self.starting_balance,
                ticket_ids: Vec::new(),
            })
            .balance
    }

    /// Buys a ticket on behalf of an existing user
    ///
    /// the balance check, the deduction, the id assignment and the ticket insertion
    /// happen as a single step. on failure nothing changes and no id is consumed.
    ///
    /// `number_range` must not be empty.
    pub fn purchase_ticket(
        &self,
        username: &str,
        price: Decimal,
        number_count: usize,
        number_range: RangeInclusive<i64>,
    ) -> Result<Purchase, LedgerError> {
        let mut user = self
            .users
            .get_mut(username)
            .ok_or_else(|| LedgerError::UnknownUser(username.into()))?;

        if user.balance < price {
            return Err(LedgerError::InsufficientFunds {
                balance: user.balance,
                price,
            });
        }

        let numbers = draw_numbers(number_count, number_range);
        let ticket = self.lock_tickets().issue(username, numbers);

        user.balance -= price;
        user.ticket_ids.push(ticket.id);

        Ok(Purchase {
            ticket,
            balance: user.balance,
        })
    }

    pub fn set_winning_number(&self, value: i64) {
        *self
            .winning_number
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    pub fn winning_number(&self) -> Option<i64> {
        *self
            .winning_number
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks whether any of the user's tickets holds the current winning number
    ///
    /// the winning number and the tickets are read one after the other,
    /// a concurrent overwrite may land in between.
    pub fn evaluate_result(&self, username: &str) -> Result<Outcome, LedgerError> {
        let winning_number = self.winning_number();
        let ticket_ids = self.ticket_ids_of(username)?;

        let Some(winning_number) = winning_number else {
            return Ok(Outcome::NotWon);
        };

        let table = self.lock_tickets();
        let won = ticket_ids
            .iter()
            .filter_map(|id| table.tickets.get(id))
            .any(|ticket| ticket.contains(winning_number));

        Ok(match won {
            true => Outcome::Won,
            false => Outcome::NotWon,
        })
    }

    /// Usernames holding at least one ticket with the given number, sorted
    pub fn winners(&self, winning_number: i64) -> Vec<String> {
        let mut winners: Vec<String> = self
            .lock_tickets()
            .tickets
            .values()
            .filter(|ticket| ticket.contains(winning_number))
            .map(|ticket| ticket.owner.clone())
            .collect();
        winners.sort();
        winners.dedup();

        winners
    }

    /// A snapshot of every issued ticket, ordered by id
    pub fn list_all_tickets(&self) -> Vec<Ticket> {
        self.lock_tickets().tickets.values().cloned().collect()
    }

    /// A snapshot of the user's tickets, in purchase order
    pub fn list_user_tickets(&self, username: &str) -> Result<Vec<Ticket>, LedgerError> {
        let ticket_ids = self.ticket_ids_of(username)?;

        let table = self.lock_tickets();
        Ok(ticket_ids
            .iter()
            .filter_map(|id| table.tickets.get(id).cloned())
            .collect())
    }

    pub fn balance_of(&self, username: &str) -> Result<Decimal, LedgerError> {
        self.users
            .get(username)
            .map(|user| user.balance)
            .ok_or_else(|| LedgerError::UnknownUser(username.into()))
    }

    /// The id of the most recently issued ticket, 0 if none was issued
    pub fn last_issued_ticket_id(&self) -> u64 {
        self.lock_tickets()
            .tickets
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    pub fn ticket_count(&self) -> usize {
        self.lock_tickets().tickets.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    // the user entry is released before the caller touches the ticket table
    fn ticket_ids_of(&self, username: &str) -> Result<Vec<u64>, LedgerError> {
        self.users
            .get(username)
            .map(|user| user.ticket_ids.clone())
            .ok_or_else(|| LedgerError::UnknownUser(username.into()))
    }

    fn lock_tickets(&self) -> MutexGuard<'_, TicketTable> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// duplicates are allowed, both within a ticket and across tickets
fn draw_numbers(count: usize, range: RangeInclusive<i64>) -> Vec<i64> {
    let mut rng = rand::thread_rng();
    (0..count).map(|_| rng.gen_range(range.clone())).collect()
}
