use std::collections::BTreeMap;

use crate::router::Router;

fn router() -> Router {
    let mut routes = BTreeMap::new();
    routes.insert("/shadows/".to_string(), "shadows".to_string());
    routes.insert("/shadows/abc/".to_string(), "shadow-abc".to_string());
    routes.insert("/shadows/abc/specific".to_string(), "specific".to_string());
    Router::new("dlq", routes)
}

#[test]
fn route_uses_longest_prefix() {
    let router = router();
    assert_eq!(router.route("/shadows/abc/xx"), "shadow-abc");
    assert_eq!(router.route("/shadows/abc/specific"), "specific");
    assert_eq!(router.route("/shadows/abc/specific/deeper"), "specific");
    assert_eq!(router.route("/shadows/other"), "shadows");
}

#[test]
fn route_falls_back_to_default() {
    let router = router();
    assert_eq!(router.route("anything-unmatched"), "dlq");
    assert_eq!(router.route("/shadows"), "dlq", "a strict prefix of a route must not match it");
    assert_eq!(router.route(""), "dlq");
    assert_eq!(router.default_route(), "dlq");
}

#[test]
fn route_skips_non_prefix_neighbours() {
    let mut routes = BTreeMap::new();
    routes.insert("state/".to_string(), "state".to_string());
    routes.insert("state/desired".to_string(), "desired".to_string());
    routes.insert("state/reported".to_string(), "reported".to_string());
    let router = Router::new("dlq", routes);

    // `state/reported` sorts between `state/desired` and `state/z` but is not a prefix of it.
    assert_eq!(router.route("state/z"), "state");
    assert_eq!(router.route("state/reported/delta"), "reported");
    assert_eq!(router.route("state/desired"), "desired");
}
