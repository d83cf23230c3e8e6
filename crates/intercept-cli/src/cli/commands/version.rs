use crate::exit_codes;

pub fn run() -> i32 {
    println!("intercept {}", env!("CARGO_PKG_VERSION"));
    println!(
        "build: {}-{} core {}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        intercept_core::http::USER_AGENT_VALUE
    );
    exit_codes::SUCCESS
}
