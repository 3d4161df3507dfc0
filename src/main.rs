use anyhow::Context;
use fa_stream::config::{ServerConfig, SpectrumSettings};
use fa_stream::streaming::{
    ChannelMask, FaServer, ReconnectPolicy, Spectrum, SpectrumConfig, SpectrumControl,
    SpectrumProcessor,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Logs the integrated motion of each id over the full band.
fn log_mean(ids: &[u8], frequencies: &[f64], mean: &Spectrum) {
    let microns = mean.to_microns();
    let top = microns.frequency_count() - 1;
    let upper = frequencies.last().copied().unwrap_or_default();
    for (column, id) in ids.iter().enumerate() {
        log::info!(
            "FA id {}: X {:.3} um, Y {:.3} um (1..{} Hz)",
            id,
            microns.sum[[top, column, 0]],
            microns.sum[[top, column, 1]],
            upper
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let server_config = ServerConfig::from_env()?;
    let settings = SpectrumSettings::from_env()?;
    log::info!(
        "fa-spectrum v{} using {}",
        env!("CARGO_PKG_VERSION"),
        server_config.address()
    );

    let server = Arc::new(FaServer::new(server_config));
    let info = *server
        .server_info()
        .await
        .context("Unable to query archiver")?;

    let mask = ChannelMask::new(settings.ids.iter().copied())?;
    let config = SpectrumConfig {
        half_block_size: settings.half_block_size,
        channel_count: mask.count(),
        frequencies: settings.frequencies.clone(),
        sample_frequency: info.decimated_frequency(),
    };
    let control = SpectrumControl::new(settings.target_count);

    let ids = mask.ids().to_vec();
    let frequencies = settings.frequencies.clone();
    let mut processor = SpectrumProcessor::new(server, mask, config, control)?
        .on_mean(move |mean| log_mean(&ids, &frequencies, mean));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, shutting down");
            interrupt.cancel();
        }
    });

    let policy = ReconnectPolicy {
        delay: settings.reconnect_delay(),
        max_attempts: None,
    };
    processor.run(policy, cancel).await?;
    Ok(())
}
