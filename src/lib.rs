pub mod app;

/// Runs the command-line front end and returns its exit code.
pub fn run() -> i32 {
    app::cli::run_cli()
}
