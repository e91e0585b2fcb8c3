use tokio::sync::watch;

/// Resolve once the shutdown flag flips to true.
///
/// A dropped sender is not a shutdown: the future then never resolves, so a
/// `select!` arm built on it can't spin.
pub async fn requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
