//! Application entry point for MailSnare.
//!
//! Initializes the Tokio runtime, sets up logging and panic handling,
//! and runs the core application logic defined in the `mail_snare`
//! library crate.

use log::error;
use std::panic;

#[tokio::main]
async fn main() {
    // Initialize logging based on RUST_LOG environment variable (defaulting to "info").
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    // Log panics before the process terminates.
    panic::set_hook(Box::new(|panic_info| {
        if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            error!("Panic occurred: {:?}", s);
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            error!("Panic occurred: {:?}", s);
        } else {
            error!("Panic occurred with unknown payload type.");
        }
        if let Some(location) = panic_info.location() {
            error!(
                "Panic occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
    }));

    if let Err(e) = mail_snare::run().await {
        error!("Application exited with error: {}", e);
        std::process::exit(1);
    }
}
