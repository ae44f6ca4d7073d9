//! Cheap memory footprint estimates for cached values.
//
// Scalars and strings are weighed by type; nested JSON is sampled to a bounded
// depth and fan-out and the sample is extrapolated, so weighing stays close to
// constant time for large documents.

use serde_json::Value;

/// Per-entry bookkeeping (map slot, LRU node, expiry index).
pub const ENTRY_OVERHEAD: usize = 96;

const MAX_DEPTH: usize = 4;
const FAN_OUT_SAMPLE: usize = 16;

const STRING_HEADER: usize = 24;
const VEC_HEADER: usize = 24;
const MAP_HEADER: usize = 48;
const SCALAR: usize = 16;
/// Assumed size of anything nested below `MAX_DEPTH`.
const OPAQUE_CHILD: usize = 64;

/// Estimated heap + inline size in bytes.
pub trait Weigh {
    fn weigh(&self) -> usize;
}

/// Size charged against the budget for `key` holding `value`.
pub fn entry_size<V: Weigh + ?Sized>(key: &str, value: &V) -> usize {
    ENTRY_OVERHEAD + key.len() + value.weigh()
}

impl Weigh for Value {
    fn weigh(&self) -> usize {
        weigh_json(self, 0)
    }
}

fn weigh_json(v: &Value, depth: usize) -> usize {
    match v {
        Value::Null | Value::Bool(_) | Value::Number(_) => SCALAR,
        Value::String(s) => STRING_HEADER + s.len(),
        Value::Array(items) => {
            if depth >= MAX_DEPTH {
                return VEC_HEADER + items.len() * OPAQUE_CHILD;
            }
            VEC_HEADER + extrapolate(items.len(), items.iter().map(|i| weigh_json(i, depth + 1)))
        }
        Value::Object(fields) => {
            if depth >= MAX_DEPTH {
                return MAP_HEADER + fields.len() * OPAQUE_CHILD;
            }
            MAP_HEADER
                + extrapolate(
                    fields.len(),
                    fields
                        .iter()
                        .map(|(k, v)| STRING_HEADER + k.len() + weigh_json(v, depth + 1)),
                )
        }
    }
}

/// Sums the first `FAN_OUT_SAMPLE` weights and scales the mean up to `total`.
fn extrapolate(total: usize, weights: impl Iterator<Item = usize>) -> usize {
    let (sampled, sum) = weights
        .take(FAN_OUT_SAMPLE)
        .fold((0usize, 0usize), |(n, sum), w| (n + 1, sum + w));
    if sampled == 0 {
        return 0;
    }
    if sampled == total {
        return sum;
    }
    sum / sampled * total
}

impl Weigh for String {
    fn weigh(&self) -> usize {
        STRING_HEADER + self.len()
    }
}

impl Weigh for str {
    fn weigh(&self) -> usize {
        STRING_HEADER + self.len()
    }
}

impl Weigh for Vec<u8> {
    fn weigh(&self) -> usize {
        VEC_HEADER + self.len()
    }
}

impl Weigh for bool {
    fn weigh(&self) -> usize {
        SCALAR
    }
}

macro_rules! weigh_numbers {
    ($($t:ty),*) => {
        $(impl Weigh for $t {
            fn weigh(&self) -> usize {
                SCALAR
            }
        })*
    };
}

// `u8` is left out: byte vectors are weighed by length above.
weigh_numbers!(i8, i16, i32, i64, u16, u32, u64, usize, isize, f32, f64);

impl<T: Weigh> Weigh for Option<T> {
    fn weigh(&self) -> usize {
        match self {
            Some(v) => v.weigh(),
            None => SCALAR,
        }
    }
}

impl<T: Weigh> Weigh for Vec<T> {
    fn weigh(&self) -> usize {
        VEC_HEADER + extrapolate(self.len(), self.iter().map(Weigh::weigh))
    }
}
