#[cfg(feature = "ssr")]
use weekly_wager::{clear_guests, establish_connection};

#[cfg(feature = "ssr")]
fn main() {
    let mut conn = establish_connection();
    let removed = clear_guests(&mut conn).expect("Failed to clear guests");
    println!(
        "Removed {} guest accounts along with their sessions and wagers.",
        removed
    );
}

#[cfg(not(feature = "ssr"))]
fn main() {
    println!("This binary requires the 'ssr' feature to be enabled.");
}
