use leptos::ev::SubmitEvent;
use leptos::logging::log;
use leptos::prelude::*;
use leptos::server_fn::error::NoCustomError;
use leptos::task::spawn_local;
use leptos_meta::{provide_meta_context, MetaTags, Stylesheet, Title};
use leptos_router::{
    components::{Route, Router, Routes},
    hooks::use_navigate,
    path, NavigateOptions,
};

use crate::model::{SessionState, UpcomingBet, WagerRecord};

#[cfg(feature = "ssr")]
use crate::model::User;
#[cfg(feature = "ssr")]
use crate::{
    choose_name, get_user_by_id, get_wager_history, list_upcoming_bets, login, logout,
    place_wager, register, resolve_session, session_state, LoginOutcome, SessionBinding,
};

#[cfg(feature = "ssr")]
use diesel::r2d2::{ConnectionManager, Pool};
#[cfg(feature = "ssr")]
use diesel::SqliteConnection;
#[cfg(feature = "ssr")]
pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

/// Pulls the session token out of a Cookie header value.
fn token_from_cookie_header(header: &str) -> Option<String> {
    header
        .split(';')
        .map(str::trim)
        .find_map(|cookie| cookie.strip_prefix("session_token="))
        .map(|value| value.to_string())
}

#[cfg(feature = "ssr")]
async fn session_token() -> Result<Option<String>, ServerFnError<NoCustomError>> {
    use axum::http::HeaderMap;
    use leptos_axum::extract;

    let headers: HeaderMap = extract()
        .await
        .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
    Ok(headers
        .get(axum::http::header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(token_from_cookie_header))
}

#[cfg(feature = "ssr")]
fn set_session_cookie(token: &str) -> Result<(), ServerFnError<NoCustomError>> {
    use leptos_axum::ResponseOptions;
    let resp: ResponseOptions = expect_context();
    let cookie = format!(
        "session_token={}; Max-Age=86400; Path=/; HttpOnly; SameSite=Strict",
        token
    );
    resp.insert_header(
        axum::http::header::SET_COOKIE,
        axum::http::HeaderValue::from_str(&cookie)
            .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?,
    );
    Ok(())
}

#[cfg(feature = "ssr")]
fn clear_session_cookie() -> Result<(), ServerFnError<NoCustomError>> {
    use leptos_axum::ResponseOptions;
    let resp: ResponseOptions = expect_context();
    let cookie = "session_token=; Max-Age=0; Path=/; HttpOnly; SameSite=Strict";
    resp.insert_header(
        axum::http::header::SET_COOKIE,
        axum::http::HeaderValue::from_str(cookie)
            .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?,
    );
    Ok(())
}

#[server(GetSession)]
pub async fn get_session() -> Result<SessionState, ServerFnError<NoCustomError>> {
    let pool: DbPool = expect_context();
    let token = session_token().await?;
    let result = tokio::task::spawn_blocking(
        move || -> Result<SessionState, ServerFnError<NoCustomError>> {
            let Some(token) = token else {
                return Ok(SessionState::Anonymous);
            };
            let mut conn = pool
                .get()
                .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
            session_state(&mut conn, &token).map_err(|e| ServerFnError::ServerError(e.to_string()))
        },
    )
    .await;
    match result {
        Ok(state) => state,
        Err(e) => Err(ServerFnError::ServerError(e.to_string())),
    }
}

#[server(GetUpcomingBets)]
pub async fn get_upcoming_bets() -> Result<Vec<UpcomingBet>, ServerFnError<NoCustomError>> {
    let pool: DbPool = expect_context();
    let result = tokio::task::spawn_blocking(
        move || -> Result<Vec<UpcomingBet>, ServerFnError<NoCustomError>> {
            let mut conn = pool
                .get()
                .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
            let today = chrono::Utc::now().date_naive();
            list_upcoming_bets(&mut conn, today)
                .map_err(|e| ServerFnError::ServerError(e.to_string()))
        },
    )
    .await;
    match result {
        Ok(bets) => bets,
        Err(e) => Err(ServerFnError::ServerError(e.to_string())),
    }
}

#[server(ChooseName)]
pub async fn choose_name_handler(
    username: String,
) -> Result<SessionState, ServerFnError<NoCustomError>> {
    let pool: DbPool = expect_context();
    let result = tokio::task::spawn_blocking(
        move || -> Result<(User, String), ServerFnError<NoCustomError>> {
            let mut conn = pool
                .get()
                .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
            choose_name(&mut conn, &username)
                .map_err(|e| ServerFnError::ServerError(e.to_string()))
        },
    )
    .await;
    let (user, token) =
        result.map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))??;
    set_session_cookie(&token)?;
    Ok(SessionState::Bound(user.into()))
}

#[server(Login)]
pub async fn login_handler(
    username: String,
    password: String,
) -> Result<SessionState, ServerFnError<NoCustomError>> {
    let pool: DbPool = expect_context();
    let result = tokio::task::spawn_blocking(
        move || -> Result<LoginOutcome, ServerFnError<NoCustomError>> {
            let mut conn = pool
                .get()
                .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
            login(&mut conn, &username, &password)
                .map_err(|e| ServerFnError::ServerError(e.to_string()))
        },
    )
    .await;
    let outcome =
        result.map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))??;
    match outcome {
        LoginOutcome::Bound { user, token } => {
            set_session_cookie(&token)?;
            Ok(SessionState::Bound(user.into()))
        }
        LoginOutcome::PendingGuest { username, token } => {
            set_session_cookie(&token)?;
            Ok(SessionState::PendingGuest { username })
        }
    }
}

#[server(Register)]
pub async fn register_handler(
    email: String,
    password: String,
    confirm: String,
) -> Result<SessionState, ServerFnError<NoCustomError>> {
    let pool: DbPool = expect_context();
    let token = session_token().await?.ok_or_else(|| {
        ServerFnError::<NoCustomError>::ServerError("You must choose a name first.".to_string())
    })?;
    let result =
        tokio::task::spawn_blocking(move || -> Result<User, ServerFnError<NoCustomError>> {
            let mut conn = pool
                .get()
                .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
            let email = email.trim();
            let email = (!email.is_empty()).then_some(email);
            register(&mut conn, &token, email, &password, &confirm)
                .map_err(|e| ServerFnError::ServerError(e.to_string()))
        })
        .await;
    let user = result.map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))??;
    Ok(SessionState::Bound(user.into()))
}

/// Places a wager for the session's bound user and returns the new balance.
#[server(PlaceWager)]
pub async fn place_wager_handler(
    bet_id: i32,
    option: String,
    amount: i32,
) -> Result<i32, ServerFnError<NoCustomError>> {
    let pool: DbPool = expect_context();
    let token = session_token().await?.ok_or_else(|| {
        ServerFnError::<NoCustomError>::ServerError("You must choose a name first.".to_string())
    })?;
    let result = tokio::task::spawn_blocking(move || -> Result<i32, ServerFnError<NoCustomError>> {
        let mut conn = pool
            .get()
            .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
        let binding = resolve_session(&mut conn, &token)
            .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
        let user = match binding {
            Some(SessionBinding::User(user)) => user,
            _ => {
                return Err(ServerFnError::ServerError(
                    "You must choose a name first.".to_string(),
                ))
            }
        };
        place_wager(&mut conn, user.id, bet_id, &option, amount)
            .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
        let refreshed = get_user_by_id(&mut conn, user.id)
            .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?
            .ok_or_else(|| {
                ServerFnError::<NoCustomError>::ServerError("User not found.".to_string())
            })?;
        Ok(refreshed.points)
    })
    .await;
    result.map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?
}

#[server(GetHistory)]
pub async fn get_history() -> Result<Vec<WagerRecord>, ServerFnError<NoCustomError>> {
    let pool: DbPool = expect_context();
    let token = session_token().await?.ok_or_else(|| {
        ServerFnError::<NoCustomError>::ServerError("You must choose a name first.".to_string())
    })?;
    let result = tokio::task::spawn_blocking(
        move || -> Result<Vec<WagerRecord>, ServerFnError<NoCustomError>> {
            let mut conn = pool
                .get()
                .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
            let binding = resolve_session(&mut conn, &token)
                .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
            let user = match binding {
                Some(SessionBinding::User(user)) => user,
                _ => {
                    return Err(ServerFnError::ServerError(
                        "You must choose a name first.".to_string(),
                    ))
                }
            };
            get_wager_history(&mut conn, user.id)
                .map_err(|e| ServerFnError::ServerError(e.to_string()))
        },
    )
    .await;
    result.map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?
}

#[server(Logout)]
pub async fn logout_handler() -> Result<(), ServerFnError<NoCustomError>> {
    let pool: DbPool = expect_context();
    if let Some(token) = session_token().await? {
        let result = tokio::task::spawn_blocking(move || -> Result<(), ServerFnError<NoCustomError>> {
            let mut conn = pool
                .get()
                .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
            logout(&mut conn, &token)
                .map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))?;
            Ok(())
        })
        .await;
        result.map_err(|e| ServerFnError::<NoCustomError>::ServerError(e.to_string()))??;
    }
    clear_session_cookie()?;
    Ok(())
}

pub fn shell(options: LeptosOptions) -> impl IntoView {
    view! {
        <!DOCTYPE html>
        <html lang="en">
            <head>
                <meta charset="utf-8" />
                <meta name="viewport" content="width=device-width, initial-scale=1" />
                <AutoReload options=options.clone() />
                <HydrationScripts options />
                <MetaTags />
            </head>
            <body>
                <App />
            </body>
        </html>
    }
}

#[component]
pub fn App() -> impl IntoView {
    // Provides context that manages stylesheets, titles, meta tags, etc.
    provide_meta_context();

    view! {
        // injects a stylesheet into the document <head>
        // id=leptos means cargo-leptos will hot-reload this stylesheet
        <Stylesheet id="leptos" href="/pkg/weekly-wager.css" />

        // sets the document title
        <Title text="The Weekly Wager" />

        <Router>
            <main>
                <Routes fallback=|| "Page not found.".into_view()>
                    <Route path=path!("/") view=Home />
                    <Route path=path!("/login") view=Login />
                    <Route path=path!("/sign-up") view=SignUp />
                    <Route path=path!("/history") view=History />
                </Routes>
            </main>
        </Router>
    }
}

#[component]
fn Home() -> impl IntoView {
    let session = Resource::new(|| (), |_| get_session());
    let bets = Resource::new(|| (), |_| get_upcoming_bets());
    let message = RwSignal::new(String::new());

    view! {
        <div>
            <h1>"The Weekly Wager"</h1>
            {move || (!message.get().is_empty()).then(|| view! { <p class="flash">{message.get()}</p> })}
            <Suspense fallback=|| {
                view! { "Checking session..." }
            }>
                {move || {
                    session
                        .with(|state| match state {
                            Some(Ok(SessionState::Bound(identity))) => {
                                view! {
                                    <div class="account">
                                        <h2>"Welcome, " {identity.username().to_string()}</h2>
                                        <p>"Balance: " {identity.points()} " points"</p>
                                        {(!identity.is_registered())
                                            .then(|| {
                                                view! {
                                                    <p>
                                                        <a href="/sign-up">"Register"</a>
                                                        " to keep your name and points."
                                                    </p>
                                                }
                                            })}
                                        <p>
                                            <a href="/history">"Bet history"</a>
                                        </p>
                                        <LogoutButton session=session />
                                    </div>
                                }
                                    .into_any()
                            }
                            Some(Ok(SessionState::PendingGuest { username })) => {
                                view! {
                                    <div class="account">
                                        <h2>"Playing as " {username.clone()}</h2>
                                        <p>
                                            "There is no account behind this name yet. "
                                            <a href="/sign-up">"Sign up"</a>
                                            " to start betting."
                                        </p>
                                    </div>
                                }
                                    .into_any()
                            }
                            Some(Ok(SessionState::Anonymous)) => {
                                view! { <ChooseName session=session message=message /> }.into_any()
                            }
                            Some(Err(e)) => {
                                view! { "Error loading session: " {e.to_string()} }.into_any()
                            }
                            None => view! { "Loading..." }.into_any(),
                        })
                }}
            </Suspense>
            <h2>"This week's bets"</h2>
            <Suspense fallback=|| {
                view! { "Loading bets..." }
            }>
                {move || {
                    bets.with(|res| match res {
                        Some(Ok(list)) if list.is_empty() => {
                            view! { <p>"No bets are open right now."</p> }.into_any()
                        }
                        Some(Ok(list)) => {
                            list.iter()
                                .map(|bet| {
                                    view! {
                                        <BetCard bet=bet.clone() session=session message=message />
                                    }
                                })
                                .collect_view()
                                .into_any()
                        }
                        Some(Err(e)) => {
                            view! { "Error loading bets: " {e.to_string()} }.into_any()
                        }
                        None => view! { "Loading..." }.into_any(),
                    })
                }}
            </Suspense>
            <p>
                "Have an account? "
                <a href="/login">"Log in"</a>
            </p>
        </div>
    }
}

#[component]
fn ChooseName(
    session: Resource<Result<SessionState, ServerFnError<NoCustomError>>>,
    message: RwSignal<String>,
) -> impl IntoView {
    let username = RwSignal::new(String::new());

    let submit = move |ev: SubmitEvent| {
        ev.prevent_default();
        let name = username.get();
        if name.trim().is_empty() {
            message.set("Please enter a name.".to_string());
            return;
        }
        spawn_local(async move {
            match choose_name_handler(name).await {
                Ok(_) => {
                    message.set(String::new());
                    session.refetch();
                }
                Err(e) => message.set(e.to_string()),
            }
        });
    };

    view! {
        <div class="account">
            <h2>"Choose a name to start betting"</h2>
            <form on:submit=submit>
                <label>
                    "Name: "
                    <input type="text" on:input=move |ev| username.set(event_target_value(&ev)) />
                </label>
                <button type="submit">"Play"</button>
            </form>
        </div>
    }
}

#[component]
fn LogoutButton(
    session: Resource<Result<SessionState, ServerFnError<NoCustomError>>>,
) -> impl IntoView {
    let on_click = move |_| {
        spawn_local(async move {
            match logout_handler().await {
                Ok(_) => session.refetch(),
                Err(e) => log!("Logout failed: {}", e),
            }
        });
    };
    view! { <button on:click=on_click>"Log out"</button> }
}

#[component]
fn BetCard(
    bet: UpcomingBet,
    session: Resource<Result<SessionState, ServerFnError<NoCustomError>>>,
    message: RwSignal<String>,
) -> impl IntoView {
    let selected = RwSignal::new(String::new());
    let amount = RwSignal::new(String::new());
    let bet_id = bet.id;

    let submit = move |ev: SubmitEvent| {
        ev.prevent_default();
        let option = selected.get();
        let amount_str = amount.get();
        if option.is_empty() || amount_str.is_empty() {
            message.set("All fields are required!".to_string());
            return;
        }
        let Ok(parsed) = amount_str.parse::<i32>() else {
            message.set("Invalid wager amount.".to_string());
            return;
        };
        spawn_local(async move {
            match place_wager_handler(bet_id, option, parsed).await {
                Ok(balance) => {
                    message.set(format!(
                        "Bet placed successfully! Your new balance is {} points.",
                        balance
                    ));
                    session.refetch();
                }
                Err(e) => message.set(e.to_string()),
            }
        });
    };

    view! {
        <div class="bet">
            <h3>{bet.title.clone()}</h3>
            <p>
                "Next " {bet.weekday_name.clone()} " is "
                {bet.next_date.format("%Y-%m-%d").to_string()} ", bets close at "
                {bet.closing_time.format("%H:%M").to_string()}
            </p>
            <form on:submit=submit>
                <label>
                    "Option: "
                    <select on:change=move |ev| selected.set(event_target_value(&ev))>
                        <option value="">"Pick an option"</option>
                        {bet
                            .options
                            .iter()
                            .map(|option| {
                                view! { <option value=option.clone()>{option.clone()}</option> }
                            })
                            .collect_view()}
                    </select>
                </label>
                <label>
                    "Points: "
                    <input
                        type="number"
                        min="1"
                        on:input=move |ev| amount.set(event_target_value(&ev))
                    />
                </label>
                <button type="submit">"Place bet"</button>
            </form>
        </div>
    }
}

#[component]
fn Login() -> impl IntoView {
    let username = RwSignal::new(String::new());
    let password = RwSignal::new(String::new());
    let error = RwSignal::new(String::new());

    let submit = move |ev: SubmitEvent| {
        ev.prevent_default();
        let u = username.get();
        let p = password.get();
        if u.is_empty() || p.is_empty() {
            error.set("Please enter a username and password.".to_string());
            return;
        }
        spawn_local(async move {
            match login_handler(u, p).await {
                Ok(_) => {
                    error.set(String::new());
                    let navigate = use_navigate();
                    navigate("/", NavigateOptions::default());
                }
                Err(e) => error.set(e.to_string()),
            }
        });
    };

    view! {
        <div>
            <h1>"Login"</h1>
            <form on:submit=submit>
                <label>
                    "Username: "
                    <input type="text" on:input=move |ev| username.set(event_target_value(&ev)) />
                </label>
                <label>
                    "Password: "
                    <input
                        type="password"
                        on:input=move |ev| password.set(event_target_value(&ev))
                    />
                </label>
                <button type="submit">"Log in"</button>
            </form>
            {move || (!error.get().is_empty()).then(|| view! { <p class="flash">{error.get()}</p> })}
            <p>
                "New here? Choose a name on the "
                <a href="/">"home page"</a>
                " instead."
            </p>
        </div>
    }
}

#[component]
fn SignUp() -> impl IntoView {
    let email = RwSignal::new(String::new());
    let password1 = RwSignal::new(String::new());
    let password2 = RwSignal::new(String::new());
    let error = RwSignal::new(String::new());

    let submit = move |ev: SubmitEvent| {
        ev.prevent_default();
        let e = email.get();
        let p1 = password1.get();
        let p2 = password2.get();
        if p1 != p2 {
            error.set("Passwords do not match.".to_string());
            return;
        }
        spawn_local(async move {
            match register_handler(e, p1, p2).await {
                Ok(_) => {
                    error.set(String::new());
                    let navigate = use_navigate();
                    navigate("/", NavigateOptions::default());
                }
                Err(err) => error.set(err.to_string()),
            }
        });
    };

    view! {
        <div>
            <h1>"Sign up"</h1>
            <p>"Registering keeps your name and points across sessions."</p>
            <form on:submit=submit>
                <label>
                    "Email (optional): "
                    <input type="email" on:input=move |ev| email.set(event_target_value(&ev)) />
                </label>
                <label>
                    "Password: "
                    <input
                        type="password"
                        on:input=move |ev| password1.set(event_target_value(&ev))
                    />
                </label>
                <label>
                    "Confirm password: "
                    <input
                        type="password"
                        on:input=move |ev| password2.set(event_target_value(&ev))
                    />
                </label>
                <button type="submit">"Create account"</button>
            </form>
            {move || (!error.get().is_empty()).then(|| view! { <p class="flash">{error.get()}</p> })}
            <p>
                <a href="/">"Back"</a>
            </p>
        </div>
    }
}

#[component]
fn History() -> impl IntoView {
    let history = Resource::new(|| (), |_| get_history());

    view! {
        <div>
            <h1>"Bet history"</h1>
            <Suspense fallback=|| {
                view! { "Loading..." }
            }>
                {move || {
                    history
                        .with(|res| match res {
                            Some(Ok(records)) if records.is_empty() => {
                                view! { <p>"No bets placed yet."</p> }.into_any()
                            }
                            Some(Ok(records)) => {
                                view! {
                                    <table>
                                        <thead>
                                            <tr>
                                                <th>"Bet"</th>
                                                <th>"Option"</th>
                                                <th>"Points"</th>
                                                <th>"Placed"</th>
                                                <th>"Outcome"</th>
                                            </tr>
                                        </thead>
                                        <tbody>
                                            {records
                                                .iter()
                                                .map(|record| {
                                                    view! {
                                                        <tr>
                                                            <td>{record.bet_title.clone()}</td>
                                                            <td>{record.option.clone()}</td>
                                                            <td>{record.wager_amount}</td>
                                                            <td>
                                                                {record.placed_at.format("%Y-%m-%d %H:%M").to_string()}
                                                            </td>
                                                            <td>{record.outcome()}</td>
                                                        </tr>
                                                    }
                                                })
                                                .collect_view()}
                                        </tbody>
                                    </table>
                                }
                                    .into_any()
                            }
                            Some(Err(e)) => view! { <p>{e.to_string()}</p> }.into_any(),
                            None => view! { "Loading..." }.into_any(),
                        })
                }}
            </Suspense>
            <p>
                <a href="/">"Back"</a>
            </p>
        </div>
    }
}
