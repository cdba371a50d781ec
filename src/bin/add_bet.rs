#[cfg(feature = "ssr")]
use weekly_wager::{create_bet, establish_connection, initialize_database};

#[cfg(feature = "ssr")]
fn main() {
    use chrono::NaiveTime;
    use weekly_wager::model::weekday_name;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 {
        eprintln!("Usage: add_bet <title> <weekday 0-6, 0 = Monday> <closing HH:MM> <option>...");
        std::process::exit(1);
    }
    let title = &args[0];
    let weekday: i32 = args[1].parse().expect("Weekday must be a number");
    let closing_time =
        NaiveTime::parse_from_str(&args[2], "%H:%M").expect("Closing time must be HH:MM");
    let options = args[3..].to_vec();

    let mut conn = establish_connection();
    initialize_database(&mut conn).expect("Failed to initialize database");
    let bet = create_bet(&mut conn, title, weekday, &options, closing_time)
        .expect("Failed to create bet");
    println!(
        "Created bet {} \"{}\" on {} with options {:?}.",
        bet.id,
        bet.title,
        weekday_name(bet.weekday),
        bet.option_labels()
    );
}

#[cfg(not(feature = "ssr"))]
fn main() {
    println!("This binary requires the 'ssr' feature to be enabled.");
}
