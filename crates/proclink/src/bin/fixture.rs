//! Child program used by the integration tests.
//!
//! Usage: proclink-fixture <mode> [args...]
//!
//! Modes:
//!   child-event   answer "myMainEvent" with "myChildEvent" { some, args }
//!   echo          reply to "myApiCall" requests with their own data
//!   errors        fail "myApiCallErrorString" and "myApiCallError" requests
//!   silent        never send ready
//!   crash         exit with status 3 before ready
//!   ignore-stop   send ready, then ignore "stop" until killed
//!   exit-on-stop  send ready, then let the link exit the process on "stop"

use std::sync::Arc;

use anyhow::{Context, bail};
use serde_json::{Value, json};

use proclink::{ExitOnStop, Link, LinkConfig, ParentConnection, Transport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    proclink::logging::init_tracing();

    let mut argv = std::env::args().skip(1);
    let mode = argv.next().context("missing mode argument")?;
    let args: Vec<String> = argv.collect();

    if mode == "exit-on-stop" {
        let config = LinkConfig::new("parent").with_stop_policy(Arc::new(ExitOnStop));
        let link = Link::connect(Transport::from_env(), config);
        link.send_ready().await?;
        link.closed().await;
        return Ok(());
    }

    let parent = ParentConnection::from_env(LinkConfig::new("parent"));
    if !parent.has_parent() {
        tracing::warn!("Not started by a controller; messages go nowhere");
    }
    let link = parent.link().clone();

    match mode.as_str() {
        "child-event" => {
            let replier = link.clone();
            link.subscribe("myMainEvent", move |_| {
                let replier = replier.clone();
                let payload = json!({ "some": "child data", "args": args.clone() });
                tokio::spawn(async move {
                    if let Err(e) = replier.send("myChildEvent", payload).await {
                        tracing::warn!(error = %e, "Failed to send myChildEvent");
                    }
                });
            });
        }
        "echo" => {
            link.on_request("myApiCall", |data| async move { Ok::<_, anyhow::Error>(data) });
        }
        "errors" => {
            link.on_request("myApiCallErrorString", |_| async {
                Err::<Value, _>("something went wrong")
            });
            link.on_request("myApiCallError", |_| async {
                Err::<Value, _>(anyhow::anyhow!("something went wrong"))
            });
        }
        "silent" => {
            parent.wait_for_shutdown().await;
            return Ok(());
        }
        "crash" => {
            tracing::error!("Crashing before ready as requested");
            std::process::exit(3);
        }
        "ignore-stop" => {
            parent.ready().await?;
            std::future::pending::<()>().await;
        }
        other => bail!("unknown mode: {other}"),
    }

    parent.ready().await?;
    parent.wait_for_shutdown().await;
    Ok(())
}
