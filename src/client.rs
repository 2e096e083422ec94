use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg};
use serde_json::Value;

use webman::data::{ErrorReply, RelayRequest, TaskOutput};
use webman::relay::DEFAULT_TIMEOUT;
use webman::{Dispatcher, HttpRelay};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let matches = App::new("client")
        .about("POSTs a JSON body to one or more URLs and prints what came back")
        .arg(
            Arg::with_name("body")
                .long("body")
                .takes_value(true)
                .help("JSON body to send [default: null]"),
        )
        .arg(
            Arg::with_name("timeout")
                .long("timeout")
                .takes_value(true)
                .help("Per-call timeout in seconds [default: 10]"),
        )
        .arg(Arg::with_name("url").required(true).multiple(true))
        .get_matches();

    let body: Value = match matches.value_of("body") {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Null,
    };
    let timeout = match matches.value_of("timeout") {
        Some(secs) => Duration::from_secs(secs.parse()?),
        None => DEFAULT_TIMEOUT,
    };
    let mut requests: Vec<RelayRequest> = matches
        .values_of("url")
        .into_iter()
        .flatten()
        .map(|url| RelayRequest::new(url, body.clone()))
        .collect();

    let dispatcher = Dispatcher::new(Arc::new(HttpRelay::new(timeout)));
    let output = if requests.len() == 1 {
        let outcome = dispatcher.dispatch_one(requests.remove(0)).await;
        match outcome.result {
            Ok(response) => TaskOutput::Success(response.into()),
            Err(e) => TaskOutput::Error(ErrorReply::new(e.to_string())),
        }
    } else {
        TaskOutput::Batch(dispatcher.dispatch_batch(requests).await)
    };

    println!("{}: {}", output.key(), serde_json::to_string_pretty(&output.data()?)?);
    Ok(())
}
