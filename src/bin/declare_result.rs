#[cfg(feature = "ssr")]
use weekly_wager::{declare_result, establish_connection};

#[cfg(feature = "ssr")]
fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 2 {
        eprintln!("Usage: declare_result <bet_id> <winning option>");
        std::process::exit(1);
    }
    let bet_id: i32 = args[0].parse().expect("Bet id must be a number");
    let winning_option = &args[1];

    let mut conn = establish_connection();
    let result =
        declare_result(&mut conn, bet_id, winning_option).expect("Failed to declare result");
    println!(
        "Declared \"{}\" as the result of bet {}; winners have been paid out and the bet is closed.",
        result.winning_option, result.bet_id
    );
}

#[cfg(not(feature = "ssr"))]
fn main() {
    println!("This binary requires the 'ssr' feature to be enabled.");
}
