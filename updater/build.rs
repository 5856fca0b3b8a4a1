use std::env;

fn main() {
    // Propagates the ESP-IDF link arguments from esp-idf-sys.
    if env::var("CARGO_FEATURE_ESP32").is_ok() {
        embuild::espidf::sysenv::output();
    }
}
