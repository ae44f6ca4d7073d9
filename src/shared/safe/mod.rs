// Panic-free helpers for arithmetic and panic payloads.

use std::any::Any;

/// Divides two counters, returning 0.0 if the denominator is zero.
pub fn divide(a: u64, b: u64) -> f64 {
    if b == 0 {
        return 0.0;
    }
    a as f64 / b as f64
}

/// Renders a caught panic payload for logs and error values.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
