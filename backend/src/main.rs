use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match server::start_server().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Server exited with error: {e}");
            ExitCode::FAILURE
        }
    }
}
