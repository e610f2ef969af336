// src/main.rs
#[tokio::main]
async fn main() {
    env_logger::init();

    let code = match tasker_cli::cli::run().await {
        Ok(exit) => exit.code(),
        Err(e) => {
            eprintln!("{}", e.user_friendly_message());
            e.exit_code()
        }
    };
    std::process::exit(code);
}
