use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use iccom_engine::{ChannelFilter, Delivery, Engine, EngineConfig};
use iccom_transport::wire_pair;

use crate::cmd::DemoArgs;
use crate::exit::{engine_error, CliError, CliResult, INTERNAL, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_stats, OutputFormat};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

pub fn run(args: DemoArgs, format: OutputFormat) -> CliResult<i32> {
    if args.payload_size == 0 {
        return Err(CliError::new(USAGE, "payload size must be at least 1 byte"));
    }

    let (link, end_a, end_b) = wire_pair();
    let config = EngineConfig::default().with_data_xfer_size(args.frame_size);

    let side_a = Engine::start(end_a, config.clone())
        .map_err(|err| engine_error("starting side a", err))?;
    let side_b =
        Engine::start(end_b, config).map_err(|err| engine_error("starting side b", err))?;

    // side B consumes via callback, side A polls
    let (delivered, deliveries) = mpsc::channel();
    side_b
        .set_channel_callback(
            ChannelFilter::Id(args.channel),
            Some(Arc::new(move |channel, id, data| {
                info!(channel, id, len = data.len(), "message delivered");
                let _ = delivered.send(data.len());
                Delivery::Taken
            })),
        )
        .map_err(|err| engine_error("installing callback", err))?;

    let pump = link
        .spawn_pump_thread()
        .map_err(|err| CliError::new(INTERNAL, format!("starting wire pump: {err}")))?;

    for round in 0..args.count {
        let payload: Vec<u8> = (0..args.payload_size)
            .map(|i| (i as u8).wrapping_add(round as u8))
            .collect();

        side_a
            .post(args.channel, &payload)
            .map_err(|err| engine_error("posting forward message", err))?;
        side_b
            .post(args.reply_channel, &payload)
            .map_err(|err| engine_error("posting reply message", err))?;

        let len = deliveries
            .recv_timeout(DELIVERY_TIMEOUT)
            .map_err(|_| CliError::new(TIMEOUT, "forward message was not delivered"))?;
        if len != args.payload_size {
            return Err(CliError::new(
                TIMEOUT,
                format!("unexpected delivery size {len}"),
            ));
        }

        wait_for_reply(&side_a, args.reply_channel)?;
    }

    let stats_a = side_a.statistics();
    let stats_b = side_b.statistics();

    side_a.close();
    side_b.close();
    let _ = pump.join();

    print_stats("side-a", &stats_a, format);
    print_stats("side-b", &stats_b, format);
    Ok(SUCCESS)
}

fn wait_for_reply(engine: &Engine<iccom_transport::WireEnd>, channel: u16) -> CliResult<()> {
    let deadline = std::time::Instant::now() + DELIVERY_TIMEOUT;
    loop {
        match engine.read(channel) {
            Ok(Some(_)) => return Ok(()),
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    return Err(CliError::new(TIMEOUT, "reply message was not delivered"));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(engine_error("reading reply", err)),
        }
    }
}
