use serde::Serialize;

/// Print a value as pretty JSON to stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    if let Ok(s) = serde_json::to_string_pretty(value) {
        println!("{s}");
    }
}
