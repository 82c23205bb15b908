#[tokio::main]
async fn main() {
    pomodoro_sync::init_tracing();
    if let Err(error) = pomodoro_sync::run().await {
        tracing::error!(%error, "pomodoro-sync exited with an error");
        std::process::exit(1);
    }
}
