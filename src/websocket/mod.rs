pub mod balances;
pub mod dapp;
pub mod requests;

fn connected_payload(stream: &str) -> String {
    serde_json::json!({
        "type": "connected",
        "message": format!("Connected to {} stream", stream)
    })
    .to_string()
}
