use std::sync::Arc;
use tokio::time::Duration;

use lembrete::clock::{Calendar, Clock, SystemClock};
use lembrete::config::Config;
use lembrete::db::Database;
use lembrete::dispatcher::{run_scheduler, Dispatcher};
use lembrete::error::AppResult;
use lembrete::gateway::{MessageGateway, TwilioWhatsApp};
use lembrete::reply::ReplyInterpreter;
use lembrete::server::{self, AppState};

#[tokio::main]
async fn main() -> AppResult<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();

    log::info!("Starting lembrete (timezone {}, country code +{})", config.timezone, config.country_code);

    if let Some(parent) = config.database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&config.database_path)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let calendar = Calendar::new(Arc::clone(&clock), config.timezone);
    let gateway: Arc<dyn MessageGateway> = Arc::new(TwilioWhatsApp::new(config.gateway.clone())?);

    let dispatcher = Arc::new(Dispatcher::new(db.clone(), Arc::clone(&gateway), calendar.clone(), &config));
    tokio::spawn(run_scheduler(dispatcher, Duration::from_secs(config.tick_interval_secs)));

    let state = AppState {
        db: db.clone(),
        replies: Arc::new(ReplyInterpreter::new(db, gateway, clock, &config)),
        calendar,
    };

    server::start_server(state, config.http_port).await
}
