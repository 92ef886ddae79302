use log::LevelFilter;

// Dependencies that log every connection at debug level
const NOISY_TARGETS: [&str; 3] = ["hyper", "reqwest", "rustls"];

pub fn setup_logging(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level);

    for target in NOISY_TARGETS {
        dispatch = dispatch.level_for(target, level.min(LevelFilter::Warn));
    }

    dispatch.chain(std::io::stdout()).apply()
}
