use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
#[cfg(feature = "ssr")]
use diesel::prelude::*;
#[cfg(feature = "ssr")]
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Display names for the stored weekday numbers, Monday first.
pub const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

pub fn weekday_name(weekday: i32) -> &'static str {
    usize::try_from(weekday)
        .ok()
        .and_then(|idx| WEEKDAY_NAMES.get(idx))
        .copied()
        .unwrap_or("Unknown")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable, Selectable))]
#[cfg_attr(feature = "ssr", diesel(table_name = crate::schema::users))]
pub struct User {
    pub id: i32,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub points: i32,
    pub created_at: NaiveDateTime,
}

impl User {
    /// A user with a password hash is registered; one without is a guest.
    pub fn is_registered(&self) -> bool {
        self.password_hash.is_some()
    }
}

#[cfg(feature = "ssr")]
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::users)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: Option<&'a str>,
    pub password_hash: Option<&'a str>,
    pub points: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable, Selectable))]
#[cfg_attr(feature = "ssr", diesel(table_name = crate::schema::bets))]
#[cfg_attr(feature = "ssr", diesel(check_for_backend(Sqlite)))]
pub struct Bet {
    pub id: i32,
    pub title: String,
    pub weekday: i32,
    // JSON array of option labels, as stored.
    pub options: String,
    pub closing_time: NaiveTime,
    pub is_active: i32,
    pub created_at: NaiveDateTime,
}

impl Bet {
    pub fn is_open(&self) -> bool {
        self.is_active == 1
    }

    /// Parses the JSON-encoded option labels. A malformed row yields no
    /// options, which also makes every wager on it invalid.
    pub fn option_labels(&self) -> Vec<String> {
        serde_json::from_str(&self.options).unwrap_or_default()
    }

    pub fn is_valid_option(&self, option: &str) -> bool {
        !option.is_empty() && self.option_labels().iter().any(|label| label == option)
    }

    /// Date of the next occurrence of this bet on or after `today`. When
    /// `today` already falls on the bet's weekday the occurrence is today,
    /// not next week.
    pub fn next_occurrence(&self, today: NaiveDate) -> NaiveDate {
        let today_weekday = i64::from(today.weekday().num_days_from_monday());
        let delta = (i64::from(self.weekday) - today_weekday + 7) % 7;
        today + Duration::days(delta)
    }
}

#[cfg(feature = "ssr")]
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::bets)]
pub struct NewBet<'a> {
    pub title: &'a str,
    pub weekday: i32,
    pub options: String,
    pub closing_time: NaiveTime,
    pub is_active: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable, Selectable))]
#[cfg_attr(feature = "ssr", diesel(table_name = crate::schema::bet_participations))]
pub struct BetParticipation {
    pub id: i32,
    pub user_id: i32,
    pub bet_id: i32,
    pub option: String,
    pub wager_amount: i32,
    pub placed_at: NaiveDateTime,
}

#[cfg(feature = "ssr")]
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::bet_participations)]
pub struct NewBetParticipation<'a> {
    pub user_id: i32,
    pub bet_id: i32,
    pub option: &'a str,
    pub wager_amount: i32,
    pub placed_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable, Selectable))]
#[cfg_attr(feature = "ssr", diesel(table_name = crate::schema::bet_results))]
pub struct BetResult {
    pub id: i32,
    pub bet_id: i32,
    pub winning_option: String,
    pub declared_at: NaiveDateTime,
}

#[cfg(feature = "ssr")]
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::bet_results)]
pub struct NewBetResult<'a> {
    pub bet_id: i32,
    pub winning_option: &'a str,
    pub declared_at: NaiveDateTime,
}

#[cfg(feature = "ssr")]
#[derive(Queryable, Selectable, Debug, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::sessions)]
#[diesel(check_for_backend(Sqlite))]
pub struct Session {
    pub id: i32,
    pub user_id: Option<i32>,
    pub guest_name: Option<String>,
    pub token: String,
    pub created_at: NaiveDateTime,
}

#[cfg(feature = "ssr")]
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::sessions)]
pub struct NewSession<'a> {
    pub user_id: Option<i32>,
    pub guest_name: Option<&'a str>,
    pub token: &'a str,
    pub created_at: NaiveDateTime,
}

/// Domain view of a user row: guests exist only by name and balance, while
/// registered accounts carry a password hash and survive across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    Guest {
        id: i32,
        username: String,
        points: i32,
    },
    Registered {
        id: i32,
        username: String,
        email: Option<String>,
        points: i32,
    },
}

impl Identity {
    pub fn id(&self) -> i32 {
        match self {
            Identity::Guest { id, .. } | Identity::Registered { id, .. } => *id,
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Identity::Guest { username, .. } | Identity::Registered { username, .. } => username,
        }
    }

    pub fn points(&self) -> i32 {
        match self {
            Identity::Guest { points, .. } | Identity::Registered { points, .. } => *points,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, Identity::Registered { .. })
    }
}

impl From<User> for Identity {
    fn from(user: User) -> Self {
        if user.password_hash.is_some() {
            Identity::Registered {
                id: user.id,
                username: user.username,
                email: user.email,
                points: user.points,
            }
        } else {
            Identity::Guest {
                id: user.id,
                username: user.username,
                points: user.points,
            }
        }
    }
}

/// What the pages know about the visitor: nobody yet, a name chosen through
/// the login fallback that has no account behind it, or a bound user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Anonymous,
    PendingGuest { username: String },
    Bound(Identity),
}

/// One row of the upcoming-bets board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpcomingBet {
    pub id: i32,
    pub title: String,
    pub weekday_name: String,
    pub next_date: NaiveDate,
    pub closing_time: NaiveTime,
    pub options: Vec<String>,
}

/// One row of a user's wager history, joined with the bet title and, once
/// declared, the winning option.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable))]
pub struct WagerRecord {
    pub id: i32,
    pub bet_title: String,
    pub option: String,
    pub wager_amount: i32,
    pub placed_at: NaiveDateTime,
    pub winning_option: Option<String>,
}

impl WagerRecord {
    pub fn outcome(&self) -> &'static str {
        match &self.winning_option {
            Some(winner) if *winner == self.option => "won",
            Some(_) => "lost",
            None => "pending",
        }
    }
}

/// Splits a settled bet's pool among the winning participations.
///
/// The pool is the sum of every wager placed on the bet. Each winning
/// participation is credited `stake * pool / winners_total`, truncating
/// towards zero; participations on other options get nothing and simply do
/// not appear in the map. With no winning participation the pool is retained
/// and the map is empty. A user who wagered more than once on the winning
/// option gets one combined credit.
pub fn settlement_payouts(
    participations: &[BetParticipation],
    result: &BetResult,
) -> HashMap<i32, i64> {
    let on_this_bet: Vec<&BetParticipation> = participations
        .iter()
        .filter(|p| p.bet_id == result.bet_id)
        .collect();
    let pool: i64 = on_this_bet.iter().map(|p| i64::from(p.wager_amount)).sum();
    let winners: Vec<&&BetParticipation> = on_this_bet
        .iter()
        .filter(|p| p.option == result.winning_option)
        .collect();
    let winners_total: i64 = winners.iter().map(|p| i64::from(p.wager_amount)).sum();

    let mut payouts = HashMap::new();
    if winners_total == 0 {
        return payouts;
    }
    for winner in winners {
        *payouts.entry(winner.user_id).or_insert(0) +=
            i64::from(winner.wager_amount) * pool / winners_total;
    }
    payouts
}
