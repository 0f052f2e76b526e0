use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Serialize parameters the way the exchange verifies them: keys sorted
/// lexicographically, `key=value` pairs joined with `&`, values
/// percent-encoded with RFC 3986 unreserved characters left intact.
///
/// Pairs with the same key are ordered by value so the result never depends
/// on insertion order.
///
/// ```
/// use engine::rest::canonical_query;
///
/// let q = canonical_query([("symbol", "BTC-USDT"), ("side", "BUY"), ("note", "a b/c")]);
/// assert_eq!(q, "note=a%20b%2Fc&side=BUY&symbol=BTC-USDT");
/// ```
pub fn canonical_query<I, K, V>(params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(K, V)> = params.into_iter().collect();
    pairs.sort_by(|a, b| {
        a.0.as_ref()
            .cmp(b.0.as_ref())
            .then_with(|| a.1.as_ref().cmp(b.1.as_ref()))
    });
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k.as_ref(), urlencoding::encode(v.as_ref())))
        .collect::<Vec<_>>()
        .join("&")
}

/// HMAC-SHA256 of `payload` keyed with `secret`, as 64 lowercase hex chars.
pub fn sign(secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Canonical query with the freshness fields added and the signature
/// appended as the final parameter.
pub fn signed_query<I, K, V>(params: I, secret: &str, timestamp_ms: i64, recv_window_ms: u64) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
        .collect();
    pairs.push(("timestamp".into(), timestamp_ms.to_string()));
    pairs.push(("recvWindow".into(), recv_window_ms.to_string()));

    let query = canonical_query(pairs);
    let signature = sign(secret, &query);
    format!("{query}&signature={signature}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Published HMAC-SHA256 example for signed REST endpoints.
    const SECRET: &str = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
    const PAYLOAD: &str = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";

    #[test]
    fn matches_known_vector() {
        assert_eq!(
            sign(SECRET, PAYLOAD),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signature_is_lowercase_hex() {
        let sig = sign("secret", "");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn unreserved_characters_are_not_escaped() {
        let q = canonical_query([("v", "AZaz09-._~")]);
        assert_eq!(q, "v=AZaz09-._~");
        let q = canonical_query([("v", "1+1=2&x")]);
        assert_eq!(q, "v=1%2B1%3D2%26x");
    }

    #[test]
    fn empty_parameters_serialize_to_empty_string() {
        assert_eq!(canonical_query(Vec::<(&str, &str)>::new()), "");
    }

    #[test]
    fn signed_query_appends_signature_last() {
        let q = signed_query([("symbol", "BTC-USDT")], "secret", 1_700_000_000_000, 5000);
        let (body, signature) = q.rsplit_once("&signature=").unwrap();
        assert_eq!(body, "recvWindow=5000&symbol=BTC-USDT&timestamp=1700000000000");
        assert_eq!(signature, sign("secret", body));
    }

    fn params() -> impl Strategy<Value = Vec<(String, String)>> {
        prop::collection::vec(("[a-zA-Z]{1,8}", "[ -~]{0,12}"), 0..8)
    }

    proptest! {
        #[test]
        fn canonicalization_ignores_insertion_order(mut pairs in params()) {
            let forward = canonical_query(pairs.clone());
            pairs.reverse();
            prop_assert_eq!(forward, canonical_query(pairs));
        }

        #[test]
        fn signing_is_deterministic(secret in "[ -~]{1,32}", payload in "[ -~]{0,64}") {
            let first = sign(&secret, &payload);
            prop_assert_eq!(first.len(), 64);
            prop_assert_eq!(first, sign(&secret, &payload));
        }

        #[test]
        fn single_character_change_changes_signature(
            payload in "[a-z]{1,40}",
            idx in any::<prop::sample::Index>(),
        ) {
            let mut bytes = payload.clone().into_bytes();
            let i = idx.index(bytes.len());
            bytes[i] = if bytes[i] == b'z' { b'a' } else { bytes[i] + 1 };
            let changed = String::from_utf8(bytes).unwrap();
            prop_assert_ne!(sign(SECRET, &payload), sign(SECRET, &changed));
        }
    }
}
