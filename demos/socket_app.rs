//! Socket App - all four interaction models between two in-process peers.
//!
//! This example demonstrates:
//! - Registering request-response routes, including a `{name}` template
//! - A fire-and-forget alert handler
//! - A request-stream of stock quotes with explicit credit
//! - A JSON request-channel computing gratuities
//!
//! # Running
//!
//! ```text
//! RUST_LOG=rsocket_mux=debug cargo run --example socket_app
//! ```

use std::time::Duration;

use futures::{stream, StreamExt};
use rsocket_mux::{ConnectionBuilder, Payload, RSocketError};
use serde::{Deserialize, Serialize};

/// Quote sent on the stock stream.
#[derive(Serialize, Deserialize, Debug)]
struct Quote {
    symbol: String,
    price: f64,
}

#[derive(Serialize, Deserialize, Debug)]
struct Bill {
    total: f64,
}

#[derive(Serialize, Deserialize, Debug)]
struct Gratuity {
    percent: u32,
    tip: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let server = ConnectionBuilder::server()
        .response("greeting", |_p, _ctx| async move {
            Ok(Payload::from("Hello back to you!"))
        })
        .response("greeting/{name}", |_p, ctx| async move {
            let name = ctx.variable("name").unwrap_or("stranger").to_string();
            Ok(Payload::from(format!("Hello, {}!", name)))
        })
        .fire_and_forget("alert", |p, _ctx| async move {
            println!("[server] alert: {}", p.data_utf8()?);
            Ok(())
        })
        .stream("stock/{symbol}", |_p, ctx| {
            let symbol = ctx.variable("symbol").unwrap_or("?").to_uppercase();
            stream::iter(0u32..).then(move |i| {
                let symbol = symbol.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Payload::json(&Quote {
                        symbol,
                        price: 100.0 + f64::from(i) * 0.25,
                    })
                }
            })
        })
        .channel("gratuity", |inbound, _ctx| {
            inbound.flat_map(|bill| {
                let bill = bill.and_then(|p| p.decode_json::<Bill>());
                let tips: Vec<rsocket_mux::Result<Payload>> = match bill {
                    Ok(bill) => [15u32, 18, 20]
                        .into_iter()
                        .map(|percent| {
                            Payload::json(&Gratuity {
                                percent,
                                tip: bill.total * f64::from(percent) / 100.0,
                            })
                        })
                        .collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(tips)
            })
        })
        .start(server_io)
        .await?;

    let client = ConnectionBuilder::client().start(client_io).await?;

    // Request-response
    let reply = client
        .request_response("greeting", Payload::from("Hello Rsocket!"))
        .await?;
    println!("[client] {}", reply.data_utf8()?);

    let reply = client
        .request_response("greeting/Jeff", Payload::empty())
        .await?;
    println!("[client] {}", reply.data_utf8()?);

    // Fire-and-forget
    client
        .fire_and_forget("alert", Payload::from("disk almost full"))
        .await?;

    // Request-stream: five quotes, two credits at a time
    let mut quotes = client
        .request_stream("stock/xyz", Payload::empty(), 2)
        .await?
        .auto_replenish(2)
        .take(5);
    while let Some(quote) = quotes.next().await {
        let quote: Quote = quote?.decode_json()?;
        println!("[client] {} @ {:.2}", quote.symbol, quote.price);
    }

    // Request-channel
    let bills = stream::iter([42.0, 100.0, 7.5].map(|total| Payload::json(&Bill { total })));
    let mut gratuities = client.request_channel("gratuity", bills, 16).await?;
    while let Some(gratuity) = gratuities.next().await {
        let gratuity: Gratuity = gratuity?.decode_json()?;
        println!("[client] {}% tip: {:.2}", gratuity.percent, gratuity.tip);
    }

    // Unknown routes fail on the requester side only
    match client.request_response("nowhere", Payload::empty()).await {
        Err(RSocketError::Remote { code, message }) => {
            println!("[client] error 0x{:03X}: {}", code, message)
        }
        other => println!("[client] unexpected: {:?}", other),
    }

    client.close().await;
    server.closed().await;
    println!("[server] stats: {}", serde_json::to_string(&server.stats())?);

    Ok(())
}
