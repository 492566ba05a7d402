mod cli;
mod credits;
mod demo;
mod infra;
mod routes;
mod server;

use propsearch::error::AppError;

pub async fn run() -> Result<(), AppError> {
    cli::run().await
}
