use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::sync::watch;

/// What should we do when the user stops this program?
/// Forward the first SIGINT/SIGTERM into the shutdown channel; the
/// reconciler and reporter take it from there.
pub fn handle_shutdown(tx: watch::Sender<bool>) {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).expect("No signals :(. This really should never happen");

    std::thread::spawn(move || {
        for _ in signals.forever() {
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            log::info!("Shutdown signal received");
            let _ = tx.send(true);
        }
    });
}
