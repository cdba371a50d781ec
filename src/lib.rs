pub mod app;
pub mod model;
#[cfg(feature = "ssr")]
pub mod schema;

#[cfg(feature = "ssr")]
use chrono::Utc;
#[cfg(feature = "ssr")]
use diesel::connection::SimpleConnection;
#[cfg(feature = "ssr")]
use diesel::prelude::*;
#[cfg(feature = "ssr")]
use diesel::SqliteConnection;
#[cfg(feature = "ssr")]
use dotenvy::dotenv;
#[cfg(feature = "ssr")]
use std::env;
#[cfg(feature = "ssr")]
use uuid::Uuid;

#[cfg(feature = "ssr")]
use crate::model::{
    settlement_payouts, weekday_name, Bet, BetParticipation, BetResult, NewBet,
    NewBetParticipation, NewBetResult, NewSession, NewUser, Session, SessionState, UpcomingBet,
    User, WagerRecord,
};
#[cfg(feature = "ssr")]
use crate::schema::{bet_participations, bet_results, bets, sessions, users};

/// Points granted to every newly created user.
pub const STARTING_POINTS: i32 = 1000;
/// Minimum username length accepted by the account workflows.
pub const MIN_USERNAME_LEN: usize = 2;
/// Minimum password length accepted when setting or checking a password.
pub const MIN_PASSWORD_LEN: usize = 7;
/// Attempts at the optimistic balance update before giving up.
#[cfg(feature = "ssr")]
const MAX_BALANCE_ATTEMPTS: u32 = 3;

#[cfg(feature = "hydrate")]
#[wasm_bindgen::prelude::wasm_bindgen]
pub fn hydrate() {
    use crate::app::*;
    console_error_panic_hook::set_once();
    leptos::mount::hydrate_body(App);
}

/// Everything a workflow can refuse a request for. These are expected,
/// user-recoverable conditions; only `Database` and `Hash` indicate real
/// trouble. The display strings are the flash messages shown to the user.
#[cfg(feature = "ssr")]
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("This bet is not open for wagers.")]
    BetInactive,
    #[error("Invalid betting option.")]
    InvalidOption,
    #[error("Wager must be a positive number.")]
    InvalidAmount,
    #[error("You do not have enough points to place that bet.")]
    InsufficientBalance,
    #[error("Username must be at least 2 characters.")]
    UsernameTooShort,
    #[error("Password must be at least 7 characters.")]
    PasswordTooShort,
    #[error("Passwords do not match.")]
    PasswordMismatch,
    #[error("Incorrect password, try again.")]
    IncorrectPassword,
    #[error("That name belongs to a registered account. Log in with its password.")]
    PasswordRequired,
    #[error("That username is already taken.")]
    UsernameTaken,
    #[error("User not found.")]
    UserNotFound,
    #[error("This account is already registered.")]
    AlreadyRegistered,
    #[error("Weekday must be between 0 (Monday) and 6 (Sunday).")]
    InvalidWeekday,
    #[error("A bet needs at least one distinct option.")]
    NoOptions,
    #[error("A result has already been declared for this bet.")]
    ResultAlreadyDeclared,
    #[error("The wager could not be placed, please try again.")]
    ConcurrencyConflict,
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

#[cfg(feature = "ssr")]
pub fn establish_connection() -> SqliteConnection {
    dotenv().ok();
    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set in .env");
    let mut conn = SqliteConnection::establish(&database_url)
        .expect(&format!("Error connecting to {}", database_url));

    // Enable WAL mode to allow concurrent reads during writes, and a timeout to retry locked
    // operations.
    conn.batch_execute(
        "PRAGMA foreign_keys = ON; \
        PRAGMA journal_mode = WAL; \
        PRAGMA synchronous = NORMAL; \
        PRAGMA busy_timeout = 10000;",
    )
    .expect("Failed to set SQLite PRAGMAs");

    conn
}

/// Schema applied at startup, kept in line with the table! definitions in
/// schema.rs. SQLite creates the database file on first connection, so a
/// fresh deployment needs nothing beyond this.
#[cfg(feature = "ssr")]
const DATABASE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        email TEXT UNIQUE,
        password_hash TEXT,
        points INTEGER NOT NULL DEFAULT 1000,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS bets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        weekday INTEGER NOT NULL,
        options TEXT NOT NULL,
        closing_time TIME NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS bet_participations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        bet_id INTEGER NOT NULL REFERENCES bets(id),
        option TEXT NOT NULL,
        wager_amount INTEGER NOT NULL,
        placed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS bet_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        bet_id INTEGER NOT NULL UNIQUE REFERENCES bets(id),
        winning_option TEXT NOT NULL,
        declared_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER REFERENCES users(id),
        guest_name TEXT,
        token TEXT NOT NULL UNIQUE,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
";

/// Creates any missing tables.
#[cfg(feature = "ssr")]
pub fn initialize_database(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    conn.batch_execute(DATABASE_SCHEMA)
}

#[cfg(feature = "ssr")]
fn is_unique_violation(error: &diesel::result::Error) -> bool {
    matches!(
        error,
        diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        )
    )
}

/// Issues a fresh session bound to a stored user and returns its token.
#[cfg(feature = "ssr")]
fn create_user_session(
    conn: &mut SqliteConnection,
    user_id: i32,
) -> Result<String, diesel::result::Error> {
    let token = Uuid::new_v4().to_string();
    let new_session = NewSession {
        user_id: Some(user_id),
        guest_name: None,
        token: &token,
        created_at: Utc::now().naive_utc(),
    };
    diesel::insert_into(sessions::table)
        .values(&new_session)
        .execute(conn)?;
    Ok(token)
}

/// Issues a session that only holds a not-yet-persisted guest username.
#[cfg(feature = "ssr")]
fn create_pending_session(
    conn: &mut SqliteConnection,
    username: &str,
) -> Result<String, diesel::result::Error> {
    let token = Uuid::new_v4().to_string();
    let new_session = NewSession {
        user_id: None,
        guest_name: Some(username),
        token: &token,
        created_at: Utc::now().naive_utc(),
    };
    diesel::insert_into(sessions::table)
        .values(&new_session)
        .execute(conn)?;
    Ok(token)
}

/// Whoever a session row is bound to.
#[cfg(feature = "ssr")]
#[derive(Debug, Clone)]
pub enum SessionBinding {
    User(User),
    PendingGuest(String),
}

/// Maps a cookie token to its binding. Unknown or malformed tokens resolve
/// to nobody.
#[cfg(feature = "ssr")]
pub fn resolve_session(
    conn: &mut SqliteConnection,
    token: &str,
) -> Result<Option<SessionBinding>, diesel::result::Error> {
    if Uuid::parse_str(token).is_err() {
        return Ok(None);
    }
    let session: Option<Session> = sessions::table
        .filter(sessions::token.eq(token))
        .select(Session::as_select())
        .first(conn)
        .optional()?;
    let Some(session) = session else {
        return Ok(None);
    };
    if let Some(user_id) = session.user_id {
        let user: Option<User> = users::table
            .filter(users::id.eq(user_id))
            .select(User::as_select())
            .first(conn)
            .optional()?;
        return Ok(user.map(SessionBinding::User));
    }
    Ok(session.guest_name.map(SessionBinding::PendingGuest))
}

/// The session state machine as the presentation layer sees it.
#[cfg(feature = "ssr")]
pub fn session_state(
    conn: &mut SqliteConnection,
    token: &str,
) -> Result<SessionState, diesel::result::Error> {
    Ok(match resolve_session(conn, token)? {
        None => SessionState::Anonymous,
        Some(SessionBinding::PendingGuest(username)) => SessionState::PendingGuest { username },
        Some(SessionBinding::User(user)) => SessionState::Bound(user.into()),
    })
}

/// Binds a new session to `username`, creating a guest account with the
/// default balance on first use.
///
/// Names held by registered accounts require a password login instead; the
/// session is never bound to a registered user without verification.
#[cfg(feature = "ssr")]
pub fn choose_name(
    conn: &mut SqliteConnection,
    username: &str,
) -> Result<(User, String), WorkflowError> {
    let username = username.trim();
    if username.chars().count() < MIN_USERNAME_LEN {
        return Err(WorkflowError::UsernameTooShort);
    }
    conn.transaction(|conn| {
        let existing: Option<User> = users::table
            .filter(users::username.eq(username))
            .select(User::as_select())
            .first(conn)
            .optional()?;
        let user = match existing {
            Some(user) if user.is_registered() => return Err(WorkflowError::PasswordRequired),
            Some(user) => user,
            None => {
                let new_user = NewUser {
                    username,
                    email: None,
                    password_hash: None,
                    points: STARTING_POINTS,
                    created_at: Utc::now().naive_utc(),
                };
                diesel::insert_into(users::table)
                    .values(&new_user)
                    .returning(User::as_returning())
                    .get_result(conn)
                    .map_err(|e| {
                        if is_unique_violation(&e) {
                            WorkflowError::UsernameTaken
                        } else {
                            WorkflowError::from(e)
                        }
                    })?
            }
        };
        let token = create_user_session(conn, user.id)?;
        Ok((user, token))
    })
}

/// Outcome of a login attempt that did not fail outright.
#[cfg(feature = "ssr")]
#[derive(Debug)]
pub enum LoginOutcome {
    /// Password verified; the session is bound to the account.
    Bound { user: User, token: String },
    /// Unknown or unregistered name: the session holds the username as a
    /// pending guest until registration, without persisting a user row.
    PendingGuest { username: String, token: String },
}

#[cfg(feature = "ssr")]
pub fn login(
    conn: &mut SqliteConnection,
    username: &str,
    password: &str,
) -> Result<LoginOutcome, WorkflowError> {
    let username = username.trim();
    if username.chars().count() < MIN_USERNAME_LEN {
        return Err(WorkflowError::UsernameTooShort);
    }
    let existing: Option<User> = users::table
        .filter(users::username.eq(username))
        .select(User::as_select())
        .first(conn)
        .optional()?;
    match existing {
        Some(user) if user.is_registered() => {
            // is_registered guarantees the hash is present.
            let hash = user.password_hash.clone().unwrap_or_default();
            if bcrypt::verify(password, &hash)? {
                let token = create_user_session(conn, user.id)?;
                Ok(LoginOutcome::Bound { user, token })
            } else {
                Err(WorkflowError::IncorrectPassword)
            }
        }
        _ => {
            let token = create_pending_session(conn, username)?;
            Ok(LoginOutcome::PendingGuest {
                username: username.to_string(),
                token,
            })
        }
    }
}

/// Turns the session's guest identity into a registered account.
///
/// A session bound to a guest user keeps its row: the id and the
/// accumulated points survive the promotion. A session holding only a
/// pending username promotes the guest account of that name if one exists,
/// and otherwise creates a fresh registered account with the default
/// balance. A concurrent registration of the same name loses to the
/// username uniqueness constraint and surfaces `UsernameTaken`.
#[cfg(feature = "ssr")]
pub fn register(
    conn: &mut SqliteConnection,
    token: &str,
    email: Option<&str>,
    password: &str,
    confirm: &str,
) -> Result<User, WorkflowError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(WorkflowError::PasswordTooShort);
    }
    if password != confirm {
        return Err(WorkflowError::PasswordMismatch);
    }
    let binding = resolve_session(conn, token)?.ok_or(WorkflowError::UserNotFound)?;
    // Hashing is slow on purpose; keep it outside the transaction.
    let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;

    conn.transaction(|conn| match binding {
        SessionBinding::User(user) => {
            if user.is_registered() {
                return Err(WorkflowError::AlreadyRegistered);
            }
            promote_guest(conn, user.id, email, &password_hash)
        }
        SessionBinding::PendingGuest(username) => {
            let existing: Option<User> = users::table
                .filter(users::username.eq(&username))
                .select(User::as_select())
                .first(conn)
                .optional()?;
            let user = match existing {
                Some(user) if user.is_registered() => return Err(WorkflowError::UsernameTaken),
                Some(user) => promote_guest(conn, user.id, email, &password_hash)?,
                None => {
                    let new_user = NewUser {
                        username: &username,
                        email,
                        password_hash: Some(&password_hash),
                        points: STARTING_POINTS,
                        created_at: Utc::now().naive_utc(),
                    };
                    diesel::insert_into(users::table)
                        .values(&new_user)
                        .returning(User::as_returning())
                        .get_result(conn)
                        .map_err(|e| {
                            if is_unique_violation(&e) {
                                WorkflowError::UsernameTaken
                            } else {
                                WorkflowError::from(e)
                            }
                        })?
                }
            };
            // Rebind the session from the pending name to the stored user.
            diesel::update(sessions::table.filter(sessions::token.eq(token)))
                .set((
                    sessions::user_id.eq(Some(user.id)),
                    sessions::guest_name.eq(None::<String>),
                ))
                .execute(conn)?;
            Ok(user)
        }
    })
}

#[cfg(feature = "ssr")]
fn promote_guest(
    conn: &mut SqliteConnection,
    user_id: i32,
    email: Option<&str>,
    password_hash: &str,
) -> Result<User, WorkflowError> {
    diesel::update(users::table.filter(users::id.eq(user_id)))
        .set((
            users::password_hash.eq(Some(password_hash)),
            users::email.eq(email),
        ))
        .execute(conn)
        .map_err(|e| {
            if is_unique_violation(&e) {
                // Only the email column can collide here.
                WorkflowError::UsernameTaken
            } else {
                WorkflowError::from(e)
            }
        })?;
    users::table
        .filter(users::id.eq(user_id))
        .select(User::as_select())
        .first(conn)
        .map_err(WorkflowError::from)
}

/// Clears the session. Unknown tokens are a no-op.
#[cfg(feature = "ssr")]
pub fn logout(conn: &mut SqliteConnection, token: &str) -> Result<usize, diesel::result::Error> {
    diesel::delete(sessions::table.filter(sessions::token.eq(token))).execute(conn)
}

/// Places a wager: validates the request in order and, in one transaction,
/// debits the user's balance and records the participation.
///
/// The debit is an optimistic compare-and-swap on the points column, retried
/// a bounded number of times, so two concurrent wagers can never both spend
/// the same balance. A validation failure leaves both the balance and the
/// participation set untouched.
#[cfg(feature = "ssr")]
pub fn place_wager(
    conn: &mut SqliteConnection,
    user_id: i32,
    bet_id: i32,
    option: &str,
    amount: i32,
) -> Result<BetParticipation, WorkflowError> {
    conn.transaction(|conn| {
        let bet: Option<Bet> = bets::table
            .filter(bets::id.eq(bet_id))
            .select(Bet::as_select())
            .first(conn)
            .optional()?;
        // A bet that does not exist is as closed as one that was switched
        // off.
        let bet = bet.ok_or(WorkflowError::BetInactive)?;
        if !bet.is_open() {
            return Err(WorkflowError::BetInactive);
        }
        if !bet.is_valid_option(option) {
            return Err(WorkflowError::InvalidOption);
        }
        if amount <= 0 {
            return Err(WorkflowError::InvalidAmount);
        }

        for _ in 0..MAX_BALANCE_ATTEMPTS {
            let user: Option<User> = users::table
                .filter(users::id.eq(user_id))
                .select(User::as_select())
                .first(conn)
                .optional()?;
            let user = user.ok_or(WorkflowError::UserNotFound)?;
            if user.points < amount {
                return Err(WorkflowError::InsufficientBalance);
            }
            // The swap only succeeds if nobody spent the balance in between.
            let updated = diesel::update(
                users::table
                    .filter(users::id.eq(user_id))
                    .filter(users::points.eq(user.points)),
            )
            .set(users::points.eq(user.points - amount))
            .execute(conn)?;
            if updated == 1 {
                let new_participation = NewBetParticipation {
                    user_id,
                    bet_id,
                    option,
                    wager_amount: amount,
                    placed_at: Utc::now().naive_utc(),
                };
                return diesel::insert_into(bet_participations::table)
                    .values(&new_participation)
                    .returning(BetParticipation::as_returning())
                    .get_result(conn)
                    .map_err(WorkflowError::from);
            }
        }
        Err(WorkflowError::ConcurrencyConflict)
    })
}

#[cfg(feature = "ssr")]
pub fn get_user_by_id(
    conn: &mut SqliteConnection,
    user_id: i32,
) -> Result<Option<User>, diesel::result::Error> {
    users::table
        .filter(users::id.eq(user_id))
        .select(User::as_select())
        .first(conn)
        .optional()
}

#[cfg(feature = "ssr")]
pub fn get_user_by_username(
    conn: &mut SqliteConnection,
    username: &str,
) -> Result<Option<User>, diesel::result::Error> {
    users::table
        .filter(users::username.eq(username))
        .select(User::as_select())
        .first(conn)
        .optional()
}

#[cfg(feature = "ssr")]
pub fn get_bet(
    conn: &mut SqliteConnection,
    bet_id: i32,
) -> Result<Option<Bet>, diesel::result::Error> {
    bets::table
        .filter(bets::id.eq(bet_id))
        .select(Bet::as_select())
        .first(conn)
        .optional()
}

/// Fetches all bets currently open for wagers.
#[cfg(feature = "ssr")]
pub fn list_active_bets(conn: &mut SqliteConnection) -> Result<Vec<Bet>, diesel::result::Error> {
    bets::table
        .filter(bets::is_active.eq(1i32))
        .order(bets::title)
        .select(Bet::as_select())
        .load(conn)
}

/// The upcoming-bets board: every open bet with the date of its next
/// occurrence relative to `today`.
#[cfg(feature = "ssr")]
pub fn list_upcoming_bets(
    conn: &mut SqliteConnection,
    today: chrono::NaiveDate,
) -> Result<Vec<UpcomingBet>, diesel::result::Error> {
    let open = list_active_bets(conn)?;
    Ok(open
        .into_iter()
        .map(|bet| UpcomingBet {
            next_date: bet.next_occurrence(today),
            weekday_name: weekday_name(bet.weekday).to_string(),
            options: bet.option_labels(),
            id: bet.id,
            title: bet.title,
            closing_time: bet.closing_time,
        })
        .collect())
}

/// A user's wagers joined with bet titles and any declared results, newest
/// first.
#[cfg(feature = "ssr")]
pub fn get_wager_history(
    conn: &mut SqliteConnection,
    user_id: i32,
) -> Result<Vec<WagerRecord>, diesel::result::Error> {
    bet_participations::table
        .inner_join(bets::table)
        .left_join(bet_results::table.on(bet_results::bet_id.eq(bet_participations::bet_id)))
        .filter(bet_participations::user_id.eq(user_id))
        .select((
            bet_participations::id,
            bets::title,
            bet_participations::option,
            bet_participations::wager_amount,
            bet_participations::placed_at,
            bet_results::winning_option.nullable(),
        ))
        .order(bet_participations::placed_at.desc())
        .load(conn)
}

#[cfg(feature = "ssr")]
pub fn get_result_by_bet(
    conn: &mut SqliteConnection,
    bet_id: i32,
) -> Result<Option<BetResult>, diesel::result::Error> {
    bet_results::table
        .filter(bet_results::bet_id.eq(bet_id))
        .select(BetResult::as_select())
        .first(conn)
        .optional()
}

#[cfg(feature = "ssr")]
pub fn get_participations_by_bet(
    conn: &mut SqliteConnection,
    bet_id: i32,
) -> Result<Vec<BetParticipation>, diesel::result::Error> {
    bet_participations::table
        .filter(bet_participations::bet_id.eq(bet_id))
        .select(BetParticipation::as_select())
        .load(conn)
}

/// Creates a recurring weekly bet. Options are deduplicated preserving
/// order; blank ones are dropped.
#[cfg(feature = "ssr")]
pub fn create_bet(
    conn: &mut SqliteConnection,
    title: &str,
    weekday: i32,
    options: &[String],
    closing_time: chrono::NaiveTime,
) -> Result<Bet, WorkflowError> {
    if !(0..=6).contains(&weekday) {
        return Err(WorkflowError::InvalidWeekday);
    }
    let mut labels: Vec<&str> = Vec::new();
    for option in options {
        let option = option.trim();
        if !option.is_empty() && !labels.contains(&option) {
            labels.push(option);
        }
    }
    if labels.is_empty() {
        return Err(WorkflowError::NoOptions);
    }
    let new_bet = NewBet {
        title,
        weekday,
        options: serde_json::to_string(&labels).unwrap_or_else(|_| "[]".to_string()),
        closing_time,
        is_active: 1,
        created_at: Utc::now().naive_utc(),
    };
    diesel::insert_into(bets::table)
        .values(&new_bet)
        .returning(Bet::as_returning())
        .get_result(conn)
        .map_err(WorkflowError::from)
}

/// Declares the winning option for a bet, credits the winners, and closes
/// the bet, all in one transaction.
///
/// The whole pool staked on the bet is split among the winning
/// participations in proportion to their stakes; integer division rounds
/// down. At most one result can ever be declared per bet.
#[cfg(feature = "ssr")]
pub fn declare_result(
    conn: &mut SqliteConnection,
    bet_id: i32,
    winning_option: &str,
) -> Result<BetResult, WorkflowError> {
    conn.transaction(|conn| {
        let bet: Bet = bets::table
            .filter(bets::id.eq(bet_id))
            .select(Bet::as_select())
            .first(conn)?;
        if !bet.is_valid_option(winning_option) {
            return Err(WorkflowError::InvalidOption);
        }
        let new_result = NewBetResult {
            bet_id,
            winning_option,
            declared_at: Utc::now().naive_utc(),
        };
        let result: BetResult = diesel::insert_into(bet_results::table)
            .values(&new_result)
            .returning(BetResult::as_returning())
            .get_result(conn)
            .map_err(|e| {
                if is_unique_violation(&e) {
                    WorkflowError::ResultAlreadyDeclared
                } else {
                    WorkflowError::from(e)
                }
            })?;

        let participations = get_participations_by_bet(conn, bet_id)?;
        for (user_id, credit) in settlement_payouts(&participations, &result) {
            diesel::update(users::table.filter(users::id.eq(user_id)))
                .set(users::points.eq(users::points + credit as i32))
                .execute(conn)?;
        }

        // A settled bet takes no further wagers.
        diesel::update(bets::table.filter(bets::id.eq(bet_id)))
            .set(bets::is_active.eq(0i32))
            .execute(conn)?;

        Ok(result)
    })
}

/// Removes every guest account along with its sessions and participations,
/// and drops pending guest sessions.
#[cfg(feature = "ssr")]
pub fn clear_guests(conn: &mut SqliteConnection) -> Result<usize, diesel::result::Error> {
    conn.transaction(|conn| {
        let guest_ids: Vec<i32> = users::table
            .filter(users::password_hash.is_null())
            .select(users::id)
            .load(conn)?;
        let bound: Vec<Option<i32>> = guest_ids.iter().map(|id| Some(*id)).collect();
        diesel::delete(sessions::table.filter(sessions::guest_name.is_not_null()))
            .execute(conn)?;
        diesel::delete(sessions::table.filter(sessions::user_id.eq_any(bound))).execute(conn)?;
        diesel::delete(
            bet_participations::table.filter(bet_participations::user_id.eq_any(guest_ids.clone())),
        )
        .execute(conn)?;
        diesel::delete(users::table.filter(users::id.eq_any(guest_ids))).execute(conn)
    })
}

/// Resets the entire database to its initial, empty state.
#[cfg(feature = "ssr")]
pub fn reset_database(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    conn.transaction(|conn| {
        diesel::delete(sessions::table).execute(conn)?;
        diesel::delete(bet_results::table).execute(conn)?;
        diesel::delete(bet_participations::table).execute(conn)?;
        diesel::delete(bets::table).execute(conn)?;
        diesel::delete(users::table).execute(conn)?;
        Ok(())
    })
}

#[cfg(all(test, feature = "ssr"))]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    // Each test gets its own in-memory database with the schema applied, so
    // the suite does not depend on an external database file.
    fn test_connection() -> SqliteConnection {
        let mut conn =
            SqliteConnection::establish(":memory:").expect("Failed to open in-memory database");
        conn.batch_execute("PRAGMA foreign_keys = ON;")
            .expect("Failed to set SQLite PRAGMAs");
        initialize_database(&mut conn).expect("Failed to apply schema");
        conn
    }

    fn seed_bet(conn: &mut SqliteConnection, title: &str, weekday: i32) -> Bet {
        let options = vec!["Yes".to_string(), "No".to_string()];
        create_bet(
            conn,
            title,
            weekday,
            &options,
            NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        )
        .expect("Failed to create bet")
    }

    fn seed_guest(conn: &mut SqliteConnection, name: &str) -> (User, String) {
        choose_name(conn, name).expect("Failed to choose name")
    }

    fn set_points(conn: &mut SqliteConnection, user_id: i32, points: i32) {
        diesel::update(users::table.filter(users::id.eq(user_id)))
            .set(users::points.eq(points))
            .execute(conn)
            .expect("Failed to set points");
    }

    fn points_of(conn: &mut SqliteConnection, user_id: i32) -> i32 {
        get_user_by_id(conn, user_id)
            .expect("Failed to fetch user")
            .expect("User not found")
            .points
    }

    fn participation_count(conn: &mut SqliteConnection, user_id: i32) -> i64 {
        bet_participations::table
            .filter(bet_participations::user_id.eq(user_id))
            .count()
            .get_result(conn)
            .expect("Failed to count participations")
    }

    #[test]
    fn test_choose_name_creates_guest_with_default_balance() {
        let mut conn = test_connection();
        let (user, token) = seed_guest(&mut conn, "alice");
        assert_eq!(user.username, "alice");
        assert_eq!(user.points, STARTING_POINTS);
        assert!(!user.is_registered());
        assert!(Uuid::parse_str(&token).is_ok());

        // The session resolves back to the same guest.
        match session_state(&mut conn, &token).unwrap() {
            SessionState::Bound(identity) => {
                assert_eq!(identity.id(), user.id);
                assert!(!identity.is_registered());
            }
            other => panic!("Unexpected session state: {:?}", other),
        }
    }

    #[test]
    fn test_choose_name_rebinds_an_existing_guest() {
        let mut conn = test_connection();
        let (first, _) = seed_guest(&mut conn, "alice");
        set_points(&mut conn, first.id, 750);

        // Choosing the same name again binds to the same row, points and
        // all.
        let (second, token) = seed_guest(&mut conn, "alice");
        assert_eq!(second.id, first.id);
        assert_eq!(points_of(&mut conn, second.id), 750);
        assert!(matches!(
            session_state(&mut conn, &token).unwrap(),
            SessionState::Bound(_)
        ));
    }

    #[test]
    fn test_choose_name_validates_length() {
        let mut conn = test_connection();
        assert!(matches!(
            choose_name(&mut conn, "a"),
            Err(WorkflowError::UsernameTooShort)
        ));
        assert!(matches!(
            choose_name(&mut conn, "  a  "),
            Err(WorkflowError::UsernameTooShort)
        ));
        let count: i64 = users::table.count().get_result(&mut conn).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_choose_name_refuses_registered_names() {
        let mut conn = test_connection();
        let (_, token) = seed_guest(&mut conn, "alice");
        register(&mut conn, &token, None, "hunter22", "hunter22").expect("Failed to register");

        // Choosing a registered name must demand the password instead of
        // silently binding to the account.
        assert!(matches!(
            choose_name(&mut conn, "alice"),
            Err(WorkflowError::PasswordRequired)
        ));
    }

    #[test]
    fn test_login_verifies_the_password() {
        let mut conn = test_connection();
        let (user, token) = seed_guest(&mut conn, "alice");
        register(&mut conn, &token, None, "hunter22", "hunter22").expect("Failed to register");

        match login(&mut conn, "alice", "hunter22").unwrap() {
            LoginOutcome::Bound { user: bound, token } => {
                assert_eq!(bound.id, user.id);
                assert!(matches!(
                    session_state(&mut conn, &token).unwrap(),
                    SessionState::Bound(_)
                ));
            }
            other => panic!("Unexpected login outcome: {:?}", other),
        }

        assert!(matches!(
            login(&mut conn, "alice", "wrong-password"),
            Err(WorkflowError::IncorrectPassword)
        ));
    }

    #[test]
    fn test_login_falls_back_to_a_pending_guest() {
        let mut conn = test_connection();
        let outcome = login(&mut conn, "newcomer", "whatever").unwrap();
        let token = match outcome {
            LoginOutcome::PendingGuest { username, token } => {
                assert_eq!(username, "newcomer");
                token
            }
            other => panic!("Unexpected login outcome: {:?}", other),
        };

        // No user row yet; the session carries only the name.
        assert!(get_user_by_username(&mut conn, "newcomer")
            .unwrap()
            .is_none());
        assert_eq!(
            session_state(&mut conn, &token).unwrap(),
            SessionState::PendingGuest {
                username: "newcomer".to_string()
            }
        );
    }

    #[test]
    fn test_register_validates_the_password() {
        let mut conn = test_connection();
        let outcome = login(&mut conn, "newcomer", "whatever").unwrap();
        let token = match outcome {
            LoginOutcome::PendingGuest { token, .. } => token,
            other => panic!("Unexpected login outcome: {:?}", other),
        };

        // Six characters is one too short; no user may be created.
        assert!(matches!(
            register(&mut conn, &token, None, "short1", "short1"),
            Err(WorkflowError::PasswordTooShort)
        ));
        assert!(matches!(
            register(&mut conn, &token, None, "long-enough", "but-different"),
            Err(WorkflowError::PasswordMismatch)
        ));
        assert!(get_user_by_username(&mut conn, "newcomer")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_register_promotes_a_bound_guest_in_place() {
        let mut conn = test_connection();
        let (user, token) = seed_guest(&mut conn, "alice");
        let bet = seed_bet(&mut conn, "Friday game", 4);
        place_wager(&mut conn, user.id, bet.id, "Yes", 200).expect("Failed to place wager");

        // Registration keeps the id and the balance as they were at that
        // moment.
        let registered = register(
            &mut conn,
            &token,
            Some("alice@example.com"),
            "hunter22",
            "hunter22",
        )
        .expect("Failed to register");
        assert_eq!(registered.id, user.id);
        assert_eq!(registered.points, STARTING_POINTS - 200);
        assert!(registered.is_registered());
        assert_eq!(registered.email.as_deref(), Some("alice@example.com"));

        // Doing it twice is refused.
        assert!(matches!(
            register(&mut conn, &token, None, "hunter22", "hunter22"),
            Err(WorkflowError::AlreadyRegistered)
        ));
    }

    #[test]
    fn test_register_from_a_pending_session() {
        let mut conn = test_connection();
        let outcome = login(&mut conn, "newcomer", "whatever").unwrap();
        let token = match outcome {
            LoginOutcome::PendingGuest { token, .. } => token,
            other => panic!("Unexpected login outcome: {:?}", other),
        };

        let user =
            register(&mut conn, &token, None, "hunter22", "hunter22").expect("Failed to register");
        assert_eq!(user.username, "newcomer");
        assert_eq!(user.points, STARTING_POINTS);
        assert!(user.is_registered());

        // The session now points at the stored account.
        match session_state(&mut conn, &token).unwrap() {
            SessionState::Bound(identity) => assert_eq!(identity.id(), user.id),
            other => panic!("Unexpected session state: {:?}", other),
        }
    }

    #[test]
    fn test_register_pending_name_promotes_an_existing_guest() {
        let mut conn = test_connection();
        // A guest named "alice" accrued a balance in some earlier session.
        let (guest, _) = seed_guest(&mut conn, "alice");
        set_points(&mut conn, guest.id, 1234);

        let outcome = login(&mut conn, "alice", "whatever").unwrap();
        let token = match outcome {
            LoginOutcome::PendingGuest { token, .. } => token,
            other => panic!("Unexpected login outcome: {:?}", other),
        };
        let user =
            register(&mut conn, &token, None, "hunter22", "hunter22").expect("Failed to register");
        assert_eq!(user.id, guest.id);
        assert_eq!(user.points, 1234);
    }

    #[test]
    fn test_register_loses_the_name_race() {
        let mut conn = test_connection();
        let outcome = login(&mut conn, "alice", "whatever").unwrap();
        let token = match outcome {
            LoginOutcome::PendingGuest { token, .. } => token,
            other => panic!("Unexpected login outcome: {:?}", other),
        };

        // Someone else registered "alice" while this session sat on the
        // sign-up form.
        let (_, other_token) = seed_guest(&mut conn, "alice");
        register(&mut conn, &other_token, None, "first-mover", "first-mover")
            .expect("Failed to register");

        assert!(matches!(
            register(&mut conn, &token, None, "hunter22", "hunter22"),
            Err(WorkflowError::UsernameTaken)
        ));
    }

    #[test]
    fn test_logout_clears_the_session() {
        let mut conn = test_connection();
        let (_, token) = seed_guest(&mut conn, "alice");
        assert_eq!(logout(&mut conn, &token).unwrap(), 1);
        assert_eq!(
            session_state(&mut conn, &token).unwrap(),
            SessionState::Anonymous
        );
        // Idempotent.
        assert_eq!(logout(&mut conn, &token).unwrap(), 0);
    }

    #[test]
    fn test_place_wager_debits_and_records() {
        let mut conn = test_connection();
        let (user, _) = seed_guest(&mut conn, "alice");
        let bet = seed_bet(&mut conn, "Friday game", 4);

        let participation =
            place_wager(&mut conn, user.id, bet.id, "Yes", 200).expect("Failed to place wager");
        assert_eq!(participation.user_id, user.id);
        assert_eq!(participation.bet_id, bet.id);
        assert_eq!(participation.option, "Yes");
        assert_eq!(participation.wager_amount, 200);

        assert_eq!(points_of(&mut conn, user.id), 800);
        assert_eq!(participation_count(&mut conn, user.id), 1);
    }

    #[test]
    fn test_place_wager_insufficient_balance_changes_nothing() {
        let mut conn = test_connection();
        let (user, _) = seed_guest(&mut conn, "alice");
        set_points(&mut conn, user.id, 100);
        let bet = seed_bet(&mut conn, "Friday game", 4);

        assert!(matches!(
            place_wager(&mut conn, user.id, bet.id, "Yes", 200),
            Err(WorkflowError::InsufficientBalance)
        ));
        assert_eq!(points_of(&mut conn, user.id), 100);
        assert_eq!(participation_count(&mut conn, user.id), 0);
    }

    #[test]
    fn test_place_wager_validation_order_and_atomicity() {
        let mut conn = test_connection();
        let (user, _) = seed_guest(&mut conn, "alice");
        let bet = seed_bet(&mut conn, "Friday game", 4);

        // Inactive bet wins over every later check.
        diesel::update(bets::table.filter(bets::id.eq(bet.id)))
            .set(bets::is_active.eq(0i32))
            .execute(&mut conn)
            .unwrap();
        assert!(matches!(
            place_wager(&mut conn, user.id, bet.id, "Maybe", -5),
            Err(WorkflowError::BetInactive)
        ));
        diesel::update(bets::table.filter(bets::id.eq(bet.id)))
            .set(bets::is_active.eq(1i32))
            .execute(&mut conn)
            .unwrap();

        assert!(matches!(
            place_wager(&mut conn, user.id, bet.id, "Maybe", 100),
            Err(WorkflowError::InvalidOption)
        ));
        assert!(matches!(
            place_wager(&mut conn, user.id, bet.id, "", 100),
            Err(WorkflowError::InvalidOption)
        ));
        assert!(matches!(
            place_wager(&mut conn, user.id, bet.id, "Yes", 0),
            Err(WorkflowError::InvalidAmount)
        ));
        assert!(matches!(
            place_wager(&mut conn, user.id, bet.id, "Yes", -10),
            Err(WorkflowError::InvalidAmount)
        ));
        // A bet nobody created behaves like a closed one.
        assert!(matches!(
            place_wager(&mut conn, user.id, 999, "Yes", 100),
            Err(WorkflowError::BetInactive)
        ));

        // None of the rejected requests touched anything.
        assert_eq!(points_of(&mut conn, user.id), STARTING_POINTS);
        assert_eq!(participation_count(&mut conn, user.id), 0);
    }

    #[test]
    fn test_place_wager_never_overspends() {
        let mut conn = test_connection();
        let (user, _) = seed_guest(&mut conn, "alice");
        let bet = seed_bet(&mut conn, "Friday game", 4);

        // Two 600-point wagers against a 1000-point balance: exactly one
        // goes through.
        place_wager(&mut conn, user.id, bet.id, "Yes", 600).expect("Failed to place wager");
        assert!(matches!(
            place_wager(&mut conn, user.id, bet.id, "No", 600),
            Err(WorkflowError::InsufficientBalance)
        ));
        assert_eq!(points_of(&mut conn, user.id), 400);
        assert_eq!(participation_count(&mut conn, user.id), 1);
    }

    #[test]
    fn test_balance_never_goes_negative() {
        let mut conn = test_connection();
        let (user, _) = seed_guest(&mut conn, "alice");
        let bet = seed_bet(&mut conn, "Friday game", 4);

        // Spend in fixed chunks until everything is refused; the balance
        // must step down and never pass zero.
        for amount in [300, 300, 300, 300, 300] {
            let before = points_of(&mut conn, user.id);
            match place_wager(&mut conn, user.id, bet.id, "Yes", amount) {
                Ok(_) => assert_eq!(points_of(&mut conn, user.id), before - amount),
                Err(WorkflowError::InsufficientBalance) => {
                    assert_eq!(points_of(&mut conn, user.id), before);
                }
                Err(e) => panic!("Unexpected error: {:?}", e),
            }
            assert!(points_of(&mut conn, user.id) >= 0);
        }
        assert_eq!(points_of(&mut conn, user.id), 100);
        assert_eq!(participation_count(&mut conn, user.id), 3);
    }

    #[test]
    fn test_wager_history_reports_outcomes() {
        let mut conn = test_connection();
        let (user, _) = seed_guest(&mut conn, "alice");
        let friday = seed_bet(&mut conn, "Friday game", 4);
        let monday = seed_bet(&mut conn, "Monday quiz", 0);

        place_wager(&mut conn, user.id, friday.id, "Yes", 100).unwrap();
        place_wager(&mut conn, user.id, monday.id, "No", 50).unwrap();
        declare_result(&mut conn, friday.id, "Yes").expect("Failed to declare result");

        let history = get_wager_history(&mut conn, user.id).expect("Failed to load history");
        assert_eq!(history.len(), 2);
        let friday_row = history
            .iter()
            .find(|r| r.bet_title == "Friday game")
            .expect("Missing row");
        assert_eq!(friday_row.outcome(), "won");
        assert_eq!(friday_row.wager_amount, 100);
        let monday_row = history
            .iter()
            .find(|r| r.bet_title == "Monday quiz")
            .expect("Missing row");
        assert_eq!(monday_row.outcome(), "pending");

        // Other users see only their own wagers.
        let (other, _) = seed_guest(&mut conn, "bob");
        assert!(get_wager_history(&mut conn, other.id).unwrap().is_empty());
    }

    #[test]
    fn test_declare_result_settles_and_closes_the_bet() {
        let mut conn = test_connection();
        let (alice, _) = seed_guest(&mut conn, "alice");
        let (bob, _) = seed_guest(&mut conn, "bob");
        let bet = seed_bet(&mut conn, "Friday game", 4);

        place_wager(&mut conn, alice.id, bet.id, "Yes", 600).unwrap();
        place_wager(&mut conn, bob.id, bet.id, "No", 400).unwrap();

        let result = declare_result(&mut conn, bet.id, "Yes").expect("Failed to declare result");
        assert_eq!(result.winning_option, "Yes");

        // Alice takes the whole 1000-point pool; Bob keeps his loss.
        assert_eq!(points_of(&mut conn, alice.id), 1400);
        assert_eq!(points_of(&mut conn, bob.id), 600);

        // The bet is closed and the result is final.
        let settled = get_bet(&mut conn, bet.id).unwrap().unwrap();
        assert!(!settled.is_open());
        assert!(get_result_by_bet(&mut conn, bet.id).unwrap().is_some());
        assert!(matches!(
            declare_result(&mut conn, bet.id, "No"),
            Err(WorkflowError::ResultAlreadyDeclared)
        ));
    }

    #[test]
    fn test_declare_result_rejects_foreign_options() {
        let mut conn = test_connection();
        let (alice, _) = seed_guest(&mut conn, "alice");
        let bet = seed_bet(&mut conn, "Friday game", 4);
        place_wager(&mut conn, alice.id, bet.id, "Yes", 100).unwrap();

        assert!(matches!(
            declare_result(&mut conn, bet.id, "Maybe"),
            Err(WorkflowError::InvalidOption)
        ));
        // Nothing settled, nothing closed.
        assert_eq!(points_of(&mut conn, alice.id), 900);
        assert!(get_result_by_bet(&mut conn, bet.id).unwrap().is_none());
        assert!(get_bet(&mut conn, bet.id).unwrap().unwrap().is_open());
    }

    #[test]
    fn test_create_bet_validates_and_dedups() {
        let mut conn = test_connection();
        let closing = NaiveTime::from_hms_opt(18, 0, 0).unwrap();

        let options = vec![
            "Yes".to_string(),
            " Yes ".to_string(),
            "".to_string(),
            "No".to_string(),
        ];
        let bet =
            create_bet(&mut conn, "Friday game", 4, &options, closing).expect("Failed to create");
        assert_eq!(bet.option_labels(), vec!["Yes", "No"]);
        assert!(bet.is_open());

        assert!(matches!(
            create_bet(&mut conn, "Bad day", 7, &options, closing),
            Err(WorkflowError::InvalidWeekday)
        ));
        assert!(matches!(
            create_bet(&mut conn, "No options", 1, &["  ".to_string()], closing),
            Err(WorkflowError::NoOptions)
        ));
    }

    #[test]
    fn test_list_upcoming_bets_skips_closed_ones() {
        let mut conn = test_connection();
        let friday = seed_bet(&mut conn, "Friday game", 4);
        let monday = seed_bet(&mut conn, "Monday quiz", 0);
        diesel::update(bets::table.filter(bets::id.eq(monday.id)))
            .set(bets::is_active.eq(0i32))
            .execute(&mut conn)
            .unwrap();

        // 2024-01-03 is a Wednesday; the Friday bet is two days out.
        let today = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let upcoming = list_upcoming_bets(&mut conn, today).expect("Failed to list");
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].id, friday.id);
        assert_eq!(upcoming[0].weekday_name, "Friday");
        assert_eq!(
            upcoming[0].next_date,
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()
        );
        assert_eq!(upcoming[0].options, vec!["Yes", "No"]);
    }

    #[test]
    fn test_clear_guests_spares_registered_accounts() {
        let mut conn = test_connection();
        let (guest, _) = seed_guest(&mut conn, "guesty");
        let bet = seed_bet(&mut conn, "Friday game", 4);
        place_wager(&mut conn, guest.id, bet.id, "Yes", 100).unwrap();

        let (_, token) = seed_guest(&mut conn, "alice");
        register(&mut conn, &token, None, "hunter22", "hunter22").unwrap();
        login(&mut conn, "stranger", "whatever").unwrap();

        clear_guests(&mut conn).expect("Failed to clear guests");

        assert!(get_user_by_username(&mut conn, "guesty").unwrap().is_none());
        assert!(get_user_by_username(&mut conn, "alice").unwrap().is_some());
        assert_eq!(participation_count(&mut conn, guest.id), 0);
        let pending: i64 = sessions::table
            .filter(sessions::guest_name.is_not_null())
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(pending, 0);
        // The registered session survives.
        assert!(matches!(
            session_state(&mut conn, &token).unwrap(),
            SessionState::Bound(_)
        ));
    }

    #[test]
    fn test_reset_database_empties_every_table() {
        let mut conn = test_connection();
        let (user, _) = seed_guest(&mut conn, "alice");
        let bet = seed_bet(&mut conn, "Friday game", 4);
        place_wager(&mut conn, user.id, bet.id, "Yes", 100).unwrap();
        declare_result(&mut conn, bet.id, "Yes").unwrap();

        reset_database(&mut conn).expect("Failed to reset");

        let users_left: i64 = users::table.count().get_result(&mut conn).unwrap();
        let bets_left: i64 = bets::table.count().get_result(&mut conn).unwrap();
        let sessions_left: i64 = sessions::table.count().get_result(&mut conn).unwrap();
        assert_eq!(users_left + bets_left + sessions_left, 0);
    }
}
