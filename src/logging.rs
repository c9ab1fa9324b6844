use log::LevelFilter;

/// Map the counted `-v` flag to a level: warnings only by default, then
/// info, debug, trace.
pub fn level_for(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install the global fern dispatcher. Plain lines by default, one JSON
/// object per line when `json` is set.
pub fn setup(verbose: u8, json: bool) -> Result<(), fern::InitError> {
    let dispatch = fern::Dispatch::new().level(level_for(verbose));
    let dispatch = if json {
        dispatch.format(|out, message, record| {
            out.finish(format_args!(
                "{}",
                serde_json::json!({
                    "ts": chrono::Utc::now().to_rfc3339(),
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "msg": message.to_string(),
                })
            ))
        })
    } else {
        dispatch.format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
    };
    dispatch.chain(std::io::stdout()).apply()?;
    Ok(())
}
