// demos/rpc_demo.rs
//
// Calculator over request/response. Runs against the in-memory broker unless
// RABBIT_BUS_DEMO_BROKER=amqp, in which case the configuration is loaded from
// rabbit_bus.json and RABBIT_BUS_* variables.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use rabbit_bus::{logging, BusClient, BusConfig, BusMessage, HandlerError, MemoryBroker, RequestOptions, ResponderConfig};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalculationRequest {
    operation: String,
    values: Vec<f64>,
}

impl BusMessage for CalculationRequest {
    fn message_type() -> &'static str {
        "calculator.request"
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalculationResponse {
    result: f64,
}

impl BusMessage for CalculationResponse {
    fn message_type() -> &'static str {
        "calculator.response"
    }
}

fn calculate(request: &CalculationRequest) -> std::result::Result<f64, HandlerError> {
    match request.operation.as_str() {
        "add" => Ok(request.values.iter().sum()),
        "multiply" => Ok(request.values.iter().product()),
        other => Err(format!("unsupported operation '{}'", other).into()),
    }
}

async fn connect() -> Result<BusClient> {
    let builder = BusClient::builder();
    let builder = match std::env::var("RABBIT_BUS_DEMO_BROKER").as_deref() {
        Ok("amqp") => builder.config(rabbit_bus::load_config()?),
        _ => builder
            .config(BusConfig {
                application_name: "rpc_demo".to_string(),
                ..BusConfig::default()
            })
            .connector(Arc::new(MemoryBroker::new())),
    };
    Ok(builder.connect().await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info,rabbit_bus=debug");
    let bus = connect().await?;

    let server = bus
        .respond(ResponderConfig::new(), |request: CalculationRequest, context| async move {
            info!(correlation_id = ?context.correlation_id, operation = %request.operation, "Calculating");
            Ok::<_, HandlerError>(CalculationResponse {
                result: calculate(&request)?,
            })
        })
        .await?;
    info!(queue = server.queue(), "Calculator listening");

    let options = || RequestOptions::new().timeout(Duration::from_secs(5));
    for (operation, values) in [("add", vec![1.5, 2.5, 3.5]), ("multiply", vec![2.0, 3.0, 4.0])] {
        let request = CalculationRequest {
            operation: operation.to_string(),
            values,
        };
        let response: CalculationResponse = bus.request(&request, options()).await?;
        println!("{} {:?} = {}", operation, request.values, response.result);
    }

    // The responder rejects this one, so the request runs into its timeout.
    let unsupported = CalculationRequest {
        operation: "divide".to_string(),
        values: vec![1.0, 0.0],
    };
    match bus
        .request::<_, CalculationResponse>(&unsupported, RequestOptions::new().timeout(Duration::from_millis(500)))
        .await
    {
        Err(e) if e.is_timeout() => println!("divide timed out as expected: {}", e),
        Err(e) => bail!("unexpected error: {}", e),
        Ok(response) => bail!("divide unexpectedly answered {}", response.result),
    }

    server.cancel().await;
    bus.shutdown().await?;
    Ok(())
}
