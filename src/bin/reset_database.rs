#[cfg(feature = "ssr")]
use weekly_wager::{establish_connection, initialize_database, reset_database};

#[cfg(feature = "ssr")]
fn main() {
    let mut conn = establish_connection();
    initialize_database(&mut conn).expect("Failed to initialize database");
    reset_database(&mut conn).expect("Failed to reset database");
    println!("Database has been reset.");
}

#[cfg(not(feature = "ssr"))]
fn main() {
    println!("This binary requires the 'ssr' feature to be enabled.");
}
