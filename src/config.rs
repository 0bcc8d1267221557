use std::{net::SocketAddr, ops::RangeInclusive, path::PathBuf};

use clap::Parser;
use rust_decimal::Decimal;

use crate::server::MAX_CONNECTIONS;

#[derive(Parser, Debug, Clone)]
#[command(name = "lottery-server")]
#[command(about = "Serves lottery ticket purchases over a line-delimited JSON protocol", long_about = None)]
pub struct Args {
    /// Address to accept client connections on
    #[arg(long, env = "LOTTERY_LISTEN", default_value = "0.0.0.0:5555")]
    pub listen: SocketAddr,

    /// Address to serve the live event feed on, disabled when absent
    #[arg(long, env = "LOTTERY_EVENTS_LISTEN")]
    pub events_listen: Option<SocketAddr>,

    /// Shared secret for admin actions
    #[arg(long, env = "LOTTERY_ADMIN_PASSWORD", default_value = "admin", hide_env_values = true)]
    pub admin_password: String,

    /// Number of connections served at the same time
    #[arg(long, default_value_t = 64)]
    pub max_connections: usize,

    #[arg(long, default_value_t = Decimal::from(100))]
    pub starting_balance: Decimal,

    #[arg(long, default_value_t = Decimal::from(10))]
    pub ticket_price: Decimal,

    #[arg(long, default_value_t = 5)]
    pub numbers_per_ticket: usize,

    /// Smallest number that can be drawn on a ticket
    #[arg(long, default_value_t = 1)]
    pub number_min: i64,

    /// Largest number that can be drawn on a ticket
    #[arg(long, default_value_t = 100)]
    pub number_max: i64,

    /// Append server events to this file
    #[arg(long, env = "LOTTERY_EVENT_LOG")]
    pub event_log: Option<PathBuf>,

    /// Default log filter, RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the number range {min}..={max} is empty")]
    EmptyNumberRange { min: i64, max: i64 },

    #[error("a ticket must hold at least one number")]
    NoNumbers,

    #[error("{0} must not be negative")]
    Negative(&'static str),

    #[error("at least one connection must be allowed")]
    NoWorkers,

    #[error("at most {max} connections can be allowed")]
    TooManyWorkers { max: usize },
}

/// How tickets are priced and drawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketPolicy {
    pub price: Decimal,
    pub number_count: usize,
    pub number_range: RangeInclusive<i64>,
}

impl Default for TicketPolicy {
    fn default() -> Self {
        Self {
            price: Decimal::from(10),
            number_count: 5,
            number_range: 1..=100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub events_listen: Option<SocketAddr>,
    pub admin_password: String,
    pub max_connections: usize,
    pub starting_balance: Decimal,
    pub policy: TicketPolicy,
    pub event_log: Option<PathBuf>,
}

impl TryFrom<Args> for Config {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if args.number_min > args.number_max {
            return Err(ConfigError::EmptyNumberRange {
                min: args.number_min,
                max: args.number_max,
            });
        }

        if args.numbers_per_ticket == 0 {
            return Err(ConfigError::NoNumbers);
        }

        if args.ticket_price.is_sign_negative() {
            return Err(ConfigError::Negative("ticket price"));
        }

        if args.starting_balance.is_sign_negative() {
            return Err(ConfigError::Negative("starting balance"));
        }

        if args.max_connections == 0 {
            return Err(ConfigError::NoWorkers);
        }

        if args.max_connections > MAX_CONNECTIONS {
            return Err(ConfigError::TooManyWorkers {
                max: MAX_CONNECTIONS,
            });
        }

        Ok(Self {
            listen: args.listen,
            events_listen: args.events_listen,
            admin_password: args.admin_password,
            max_connections: args.max_connections,
            starting_balance: args.starting_balance,
            policy: TicketPolicy {
                price: args.ticket_price,
                number_count: args.numbers_per_ticket,
                number_range: args.number_min..=args.number_max,
            },
            event_log: args.event_log,
        })
    }
}
