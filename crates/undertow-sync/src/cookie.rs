// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Server ordering cookies.
//!
//! A cookie is an opaque JSON ordering token: `null`, a number, a string, or
//! an object carrying an `order` member. The total order is: `null` least;
//! numbers before strings; numbers and strings by natural order; objects
//! compare by their `order` member (a missing member ranks as `null`).

use std::cmp::Ordering;

use serde_json::Value;

/// A cookie is JSON; the ordering below is what makes it a cookie.
pub type Cookie = Value;

/// Totally orders two cookies.
pub fn compare_cookies(a: &Cookie, b: &Cookie) -> Ordering {
    let a = order_component(a);
    let b = order_component(b);
    match (rank(a), rank(b)) {
        (ra, rb) if ra != rb => ra.cmp(&rb),
        _ => match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                let x = x.as_f64().unwrap_or_default();
                let y = y.as_f64().unwrap_or_default();
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            (Value::String(x), Value::String(y)) => x.cmp(y),
            _ => Ordering::Equal,
        },
    }
}

/// The member an object cookie is ordered by.
fn order_component(cookie: &Cookie) -> &Value {
    match cookie {
        Value::Object(map) => map.get("order").unwrap_or(&Value::Null),
        other => other,
    }
}

fn rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        _ => 2,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_is_least() {
        assert_eq!(compare_cookies(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_cookies(&json!(null), &json!("")), Ordering::Less);
        assert_eq!(compare_cookies(&json!(null), &json!(null)), Ordering::Equal);
    }

    #[test]
    fn numbers_and_strings_order_naturally() {
        assert_eq!(compare_cookies(&json!(1), &json!(2)), Ordering::Less);
        assert_eq!(compare_cookies(&json!("a"), &json!("b")), Ordering::Less);
        assert_eq!(compare_cookies(&json!(2), &json!("a")), Ordering::Less);
        assert_eq!(compare_cookies(&json!("c2"), &json!("c1")), Ordering::Greater);
    }

    #[test]
    fn objects_compare_by_order_member() {
        let a = json!({"order": 5, "extra": true});
        let b = json!({"order": 9});
        assert_eq!(compare_cookies(&a, &b), Ordering::Less);
        // Missing order ranks as null.
        assert_eq!(
            compare_cookies(&json!({"x": 1}), &json!({"order": 0})),
            Ordering::Less
        );
    }
}
