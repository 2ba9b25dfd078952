//! Mapping between request URLs and backend keys.
//!
//! A key is the URL without its fragment and credentials. Uploads are keyed separately by
//! prefixing the upload identifier: `$upload_id/$url`.

use url::Url;

/// Strips the parts of `url` that must not influence caching.
fn request_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    // both fail only for URLs that can not have credentials in the first place
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.into()
}

/// Generates the backend key for a request.
///
/// `upload_id` is non-zero for requests with an upload body that must not share an entry with
/// the plain request.
pub fn generate(url: &Url, upload_id: i64) -> String {
    let url_key = request_url(url);
    if upload_id == 0 {
        url_key
    } else {
        format!("{upload_id}/{url_key}")
    }
}

/// Recovers the resource URL from a backend key.
pub fn resource_url(key: &str) -> Option<Url> {
    if let Ok(url) = Url::parse(key) {
        if url.has_host() {
            return Some(url);
        }
    }
    let (upload_id, url_key) = key.split_once('/')?;
    upload_id.parse::<i64>().ok()?;
    Url::parse(url_key).ok()
}
