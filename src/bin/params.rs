use fishview::config::ViewerConfig;
use serde_json::json;

fn main() {
    let config = ViewerConfig::default();
    let json = json!(config);
    println!("{}", serde_json::to_string_pretty(&json).unwrap());
}
