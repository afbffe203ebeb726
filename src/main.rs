use std::process::ExitCode;

mod app;
mod cli;
mod config;
mod dispatch;
mod event;
mod logger;
mod pipeline;
mod player;
mod policy;
mod resolve;
mod state;
mod store;
mod values;

#[cfg(test)]
mod unit_tests;

fn main() -> ExitCode {
    app::main()
}
