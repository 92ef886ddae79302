mod logging;
mod mail_dispatcher;
mod settings;
mod upload_handler;
mod web;


use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{value_parser, Arg, Command};
use log::{info, LevelFilter};

use crate::mail_dispatcher::{GoogleTokenProvider, MailDispatcher, SmtpTransportFactory};

fn cli() -> Command {
    Command::new("formrelay")
        .about("Relays a web form submission as an OAuth2-authenticated email")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .default_value(settings::DEFAULT_SETTINGS_PATH),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(value_parser!(LevelFilter))
                .default_value("info"),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let level = matches
        .get_one::<LevelFilter>("log-level")
        .copied()
        .unwrap_or(LevelFilter::Info);
    logging::setup_logging(level)?;

    if let Ok(path) = dotenvy::dotenv() {
        info!("Loaded environment from {}", path.display());
    }

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(settings::DEFAULT_SETTINGS_PATH));
    let mut config = settings::load_settings(&config_path)?;
    if let Some(port) = matches.get_one::<u16>("port") {
        config.server.port = *port;
    }

    let token_provider = GoogleTokenProvider::from_config(&config.mail)
        .context("invalid OAuth endpoint configuration")?;
    let dispatcher = MailDispatcher::new(
        &config.mail,
        Arc::new(token_provider),
        Arc::new(SmtpTransportFactory::from_config(&config.mail)),
    );

    let state = web::AppState {
        tera: Arc::new(web::load_templates()?),
        dispatcher: Arc::new(dispatcher),
        attachments: config.attachments.clone(),
    };

    web::start_server(&config.server, web::create_router(state)).await
}
