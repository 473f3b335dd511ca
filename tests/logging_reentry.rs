use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{json, Map, Value};

use middle_run::logging::{self, Level};
use middle_run::{from_sync_fn, Eventual, Invocation, Runner};

#[tokio::test]
async fn a_sink_may_use_the_handles_of_the_step_being_logged() -> Result<()> {
    let slot: Arc<Mutex<Option<Invocation>>> = Arc::new(Mutex::new(None));
    let observed: Arc<Mutex<Vec<Eventual>>> = Arc::new(Mutex::new(Vec::new()));

    let sink_slot = slot.clone();
    let sink_observed = observed.clone();
    logging::set_sink(Arc::new(move |entry: &Map<String, Value>| {
        if entry.get("message") != Some(&json!("chain resolved")) {
            return;
        }
        if let Some(inv) = sink_slot.lock().unwrap().take() {
            sink_observed.lock().unwrap().push(inv.advance());
        }
    }));
    logging::set_level(Level::Debug);

    let step_slot = slot.clone();
    let runner = Runner::single(from_sync_fn(move |inv: Invocation| {
        *step_slot.lock().unwrap() = Some(inv.clone());
        let _ = inv.resolve(json!("logged"));
        Ok(())
    }));
    let value = runner.invoke().await;

    logging::reset_sink();
    logging::set_level(Level::Warn);

    assert_eq!(value?, Some(json!("logged")));
    let observed: Vec<Eventual> = observed.lock().unwrap().drain(..).collect();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].clone().await?, Some(json!("logged")));
    Ok(())
}
