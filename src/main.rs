use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match log_collect::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
