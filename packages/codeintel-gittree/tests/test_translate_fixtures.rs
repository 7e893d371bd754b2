//! Translation fixtures taken from real-world `git diff` output.
//!
//! Fixture line numbers are 1-indexed like the diff headers; they are
//! converted to 0-indexed positions before translating.

use std::sync::Arc;

use async_trait::async_trait;
use codeintel_gittree::{
    parse_hunks, translate_position, translate_range, DiffSource, Direction, GitTreeTranslator,
    Hunk, Position, Range, Result, TranslationRequest,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

// git diff 8947c3fa0beec021e14b3f8040857335e1ecd473 3e9db2ad951dbb1000cd0f8f25e4a95445046679 -- resources/image.go
const HUGO_DIFF: &str = r#"
diff --git a/resources/image.go b/resources/image.go
index d1d9f650d673..076f2ae4d63b 100644
--- a/resources/image.go
+++ b/resources/image.go
@@ -36,7 +36,6 @@ import (

        "github.com/gohugoio/hugo/resources/resource"

-       "github.com/sourcegraph/sourcegraph/lib/errors"
        _errors "github.com/sourcegraph/sourcegraph/lib/errors"

        "github.com/gohugoio/hugo/helpers"
@@ -235,7 +234,7 @@ const imageProcWorkers = 1
 var imageProcSem = make(chan bool, imageProcWorkers)

 func (i *imageResource) doWithImageConfig(conf images.ImageConfig, f func(src image.Image) (image.Image, error)) (resource.Image, error) {
-       img, err := i.getSpec().imageCache.getOrCreate(i, conf, func() (*imageResource, image.Image, error) {
+       return i.getSpec().imageCache.getOrCreate(i, conf, func() (*imageResource, image.Image, error) {
                imageProcSem <- true
                defer func() {
                        <-imageProcSem
@@ -292,13 +291,6 @@ func (i *imageResource) doWithImageConfig(conf images.ImageConfig, f func(src im

                return ci, converted, nil
        })
-
-       if err != nil {
-               if i.root != nil && i.root.getFileInfo() != nil {
-                       return nil, errors.Wrapf(err, "image %q", i.root.getFileInfo().Meta().Filename())
-               }
-       }
-       return img, nil
 }

 func (i *imageResource) decodeImageConfig(action, spec string) (images.ImageConfig, error) {
"#;

// git diff 52025bd7a9446c3178bf01dd2949d4874dd45f24 45fbed94d6ee17840254e78cfc421ab1db78f734 -- discovery/manager.go
const PROMETHEUS_DIFF: &str = r#"
diff --git a/discovery/manager.go b/discovery/manager.go
index 49bcbf86b7ba..d135cd54e700 100644
--- a/discovery/manager.go
+++ b/discovery/manager.go
@@ -293,11 +293,11 @@ func (m *Manager) updateGroup(poolKey poolKey, tgs []*targetgroup.Group) {
        m.mtx.Lock()
        defer m.mtx.Unlock()

-       if _, ok := m.targets[poolKey]; !ok {
-               m.targets[poolKey] = make(map[string]*targetgroup.Group)
-       }
        for _, tg := range tgs {
                if tg != nil { // Some Discoverers send nil target group so need to check for it to avoid panics.
+                       if _, ok := m.targets[poolKey]; !ok {
+                               m.targets[poolKey] = make(map[string]*targetgroup.Group)
+                       }
                        m.targets[poolKey][tg.Source] = tg
                }
        }
"#;

// Truncated to its first six hunks
// git diff 5e915e0149386ce3d02379ff93f4c0a5601779d5 8715fe718dfdf487a919acb6df7da109346bbfd6 -- route_linux.go
const NETLINK_DIFF: &str = r#"
diff --git a/route_linux.go b/route_linux.go
index 8da8866573c8..02f4de38f03c 100644
--- a/route_linux.go
+++ b/route_linux.go
@@ -41,7 +41,6 @@ func (s Scope) String() string {
 	}
 }

-
 const (
 	FLAG_ONLINK    NextHopFlag = unix.RTNH_F_ONLINK
 	FLAG_PERVASIVE NextHopFlag = unix.RTNH_F_PERVASIVE
@@ -656,7 +655,8 @@ func RouteAdd(route *Route) error {
 func (h *Handle) RouteAdd(route *Route) error {
 	flags := unix.NLM_F_CREATE | unix.NLM_F_EXCL | unix.NLM_F_ACK
 	req := h.newNetlinkRequest(unix.RTM_NEWROUTE, flags)
-	return h.routeHandle(route, req, nl.NewRtMsg())
+	_, err := h.routeHandle(route, req, nl.NewRtMsg())
+	return err
 }

 // RouteAppend will append a route to the system.
@@ -670,7 +670,8 @@ func RouteAppend(route *Route) error {
 func (h *Handle) RouteAppend(route *Route) error {
 	flags := unix.NLM_F_CREATE | unix.NLM_F_APPEND | unix.NLM_F_ACK
 	req := h.newNetlinkRequest(unix.RTM_NEWROUTE, flags)
-	return h.routeHandle(route, req, nl.NewRtMsg())
+	_, err := h.routeHandle(route, req, nl.NewRtMsg())
+	return err
 }

 // RouteAddEcmp will add a route to the system.
@@ -682,7 +683,8 @@ func RouteAddEcmp(route *Route) error {
 func (h *Handle) RouteAddEcmp(route *Route) error {
 	flags := unix.NLM_F_CREATE | unix.NLM_F_ACK
 	req := h.newNetlinkRequest(unix.RTM_NEWROUTE, flags)
-	return h.routeHandle(route, req, nl.NewRtMsg())
+	_, err := h.routeHandle(route, req, nl.NewRtMsg())
+	return err
 }

 // RouteReplace will add a route to the system.
@@ -696,7 +698,8 @@ func RouteReplace(route *Route) error {
 func (h *Handle) RouteReplace(route *Route) error {
 	flags := unix.NLM_F_CREATE | unix.NLM_F_REPLACE | unix.NLM_F_ACK
 	req := h.newNetlinkRequest(unix.RTM_NEWROUTE, flags)
-	return h.routeHandle(route, req, nl.NewRtMsg())
+	_, err := h.routeHandle(route, req, nl.NewRtMsg())
+	return err
 }

 // RouteDel will delete a route from the system.
@@ -709,12 +712,13 @@ func RouteDel(route *Route) error {
 // Equivalent to: `ip route del $route`
 func (h *Handle) RouteDel(route *Route) error {
 	req := h.newNetlinkRequest(unix.RTM_DELROUTE, unix.NLM_F_ACK)
-	return h.routeHandle(route, req, nl.NewRtDelMsg())
+	_, err := h.routeHandle(route, req, nl.NewRtDelMsg())
+	return err
 }

-func (h *Handle) routeHandle(route *Route, req *nl.NetlinkRequest, msg *nl.RtMsg) error {
-	if (route.Dst == nil || route.Dst.IP == nil) && route.Src == nil && route.Gw == nil && route.MPLSDst == nil {
-		return fmt.Errorf("one of Dst.IP, Src, or Gw must not be nil")
+func (h *Handle) routeHandle(route *Route, req *nl.NetlinkRequest, msg *nl.RtMsg) ([][]byte, error) {
+	if req.NlMsghdr.Type != unix.RTM_GETROUTE && (route.Dst == nil || route.Dst.IP == nil) && route.Src == nil && route.Gw == nil && route.MPLSDst == nil {
+		return nil, fmt.Errorf("Either Dst.IP, Src.IP or Gw must be set")
 	}

 	family := -1
"#;

struct Case {
    description: &'static str,
    line: u32,
    expected: Option<u32>,
}

const fn case(description: &'static str, line: u32, expected: Option<u32>) -> Case {
    Case {
        description,
        line,
        expected,
    }
}

const HUGO_CASES: &[Case] = &[
    // Between hunks
    case("before first hunk", 10, Some(10)),
    case("between hunks (1x deletion)", 150, Some(149)),
    case("between hunks (1x deletion, 1x edit)", 250, Some(249)),
    case("after last hunk (2x deletions, 1x edit)", 350, Some(342)),
    // Hunk 1
    case("before first hunk deletion", 38, Some(38)),
    case("on first hunk deletion", 39, None),
    case("after first hunk deletion", 40, Some(39)),
    // Hunk 1 lower border
    case("inside first hunk context (last line)", 43, Some(42)),
    case("directly after first hunk", 44, Some(43)),
    // Hunk 2
    case("before second hunk edit", 237, Some(236)),
    case("on second hunk edit", 238, None),
    case("after second hunk edit", 239, Some(238)),
    // Hunk 3
    case("before third hunk deletion", 294, Some(293)),
    case("on third hunk deletion (first)", 295, None),
    case("on third hunk deletion (last)", 301, None),
    case("after third hunk deletion", 302, Some(294)),
];

const PROMETHEUS_CASES: &[Case] = &[
    case("before hunk", 100, Some(100)),
    case("before deletion", 295, Some(295)),
    case("on deletion 1", 296, None),
    case("on deletion 2", 297, None),
    case("on deletion 3", 298, None),
    case("after deletion", 299, Some(296)),
    case("before insertion", 300, Some(297)),
    case("after insertion", 301, Some(301)),
    case("after hunk", 500, Some(500)),
];

// A context line opening a hunk maps through the body like any other
// unchanged line, so `func (h *Handle) RouteAdd` keeps its counterpart.
const NETLINK_CASES: &[Case] = &[
    case("before first hunk", 10, Some(10)),
    case("on removed blank line", 44, None),
    case("after removed blank line", 45, Some(44)),
    case("first line of second hunk", 656, Some(655)),
    case("on second hunk edit", 659, None),
    case("after second hunk edit", 660, Some(660)),
    case("between hunks (net zero)", 663, Some(663)),
    case("inside fifth hunk", 700, Some(703)),
    case("after last hunk", 800, Some(804)),
];

fn run_cases(name: &str, diff: &str, cases: &[Case]) {
    let hunks = parse_hunks(diff).unwrap();
    for case in cases {
        let pos = Position::new(case.line - 1, 10);
        let adjusted = translate_position(&hunks, pos, Direction::Forward);
        assert_eq!(
            adjusted.map(|p| p.line + 1),
            case.expected,
            "{} : {}",
            name,
            case.description
        );
        if let Some(p) = adjusted {
            assert_eq!(p.character, 10, "{} : {}", name, case.description);

            let back = translate_position(&hunks, p, Direction::Reverse);
            assert_eq!(back, Some(pos), "{} : {} (reverse)", name, case.description);
        }
    }
}

#[test]
fn test_hugo_fixture() {
    let hunks = parse_hunks(HUGO_DIFF).unwrap();
    assert_eq!(hunks.len(), 3);
    assert_eq!(
        hunks
            .iter()
            .map(|h| (h.orig_start, h.orig_len, h.new_start, h.new_len))
            .collect::<Vec<_>>(),
        vec![(36, 7, 36, 6), (235, 7, 234, 7), (292, 13, 291, 6)]
    );
    run_cases("hugo", HUGO_DIFF, HUGO_CASES);
}

#[test]
fn test_prometheus_fixture() {
    run_cases("prometheus", PROMETHEUS_DIFF, PROMETHEUS_CASES);
}

#[test]
fn test_netlink_fixture() {
    let hunks = parse_hunks(NETLINK_DIFF).unwrap();
    assert_eq!(
        hunks.iter().map(|h| h.orig_start).collect::<Vec<_>>(),
        vec![41, 656, 670, 682, 696, 709]
    );
    run_cases("netlink", NETLINK_DIFF, NETLINK_CASES);
}

#[test]
fn test_hugo_range() {
    let hunks = parse_hunks(HUGO_DIFF).unwrap();
    let range = Range::new(Position::new(302, 15), Position::new(305, 20));
    let expected = Range::new(Position::new(294, 15), Position::new(297, 20));

    assert_eq!(translate_range(&hunks, range, Direction::Forward), Some(expected));
    assert_eq!(translate_range(&hunks, expected, Direction::Reverse), Some(range));
    assert_eq!(translate_range(&[], range, Direction::Forward), Some(range));
}

#[test]
fn test_hugo_range_through_deletion_misses() {
    let hunks = parse_hunks(HUGO_DIFF).unwrap();
    let range = Range::new(Position::new(290, 0), Position::new(296, 3));
    assert_eq!(translate_range(&hunks, range, Direction::Forward), None);
}

// ═══════════════════════════════════════════════════════════════════════
// GitTreeTranslator over a fixed diff
// ═══════════════════════════════════════════════════════════════════════

struct FixedDiff(&'static str);

#[async_trait]
impl DiffSource for FixedDiff {
    async fn diff(&self, repository: &str, from: &str, to: &str, path: &str) -> Result<String> {
        assert_eq!(repository, "github.com/gohugoio/hugo");
        assert_eq!((from, to), ("deadbeef1", "deadbeef2"));
        assert_eq!(path, "/foo/bar.go");
        Ok(self.0.to_string())
    }
}

fn hugo_translator(diff: &'static str) -> GitTreeTranslator {
    GitTreeTranslator::new(
        Arc::new(FixedDiff(diff)),
        TranslationRequest::new("github.com/gohugoio/hugo", "deadbeef1", "/foo/bar.go"),
    )
}

#[tokio::test]
async fn test_translator_position() {
    let translator = hugo_translator(HUGO_DIFF);
    let out = translator
        .translate_position("deadbeef2", Position::new(302, 15), false)
        .await
        .unwrap();
    assert_eq!(out, Some(Position::new(294, 15)));
}

#[tokio::test]
async fn test_translator_position_reverse() {
    let translator = hugo_translator(HUGO_DIFF);
    let out = translator
        .translate_position("deadbeef2", Position::new(294, 15), true)
        .await
        .unwrap();
    assert_eq!(out, Some(Position::new(302, 15)));
}

#[tokio::test]
async fn test_translator_empty_diff() {
    let translator = hugo_translator("");
    let pos = Position::new(10, 15);
    let out = translator.translate_position("deadbeef2", pos, false).await.unwrap();
    assert_eq!(out, Some(pos));

    let range = Range::new(Position::new(302, 15), Position::new(305, 20));
    let out = translator
        .translate_range("deadbeef2", "/foo/bar.go", range, false)
        .await
        .unwrap();
    assert_eq!(out, Some(range));
}

#[tokio::test]
async fn test_translator_range_both_directions() {
    let translator = hugo_translator(HUGO_DIFF);
    let source = Range::new(Position::new(302, 15), Position::new(305, 20));
    let target = Range::new(Position::new(294, 15), Position::new(297, 20));

    let out = translator
        .translate_range("deadbeef2", "/foo/bar.go", source, false)
        .await
        .unwrap();
    assert_eq!(out, Some(target));

    let out = translator
        .translate_range("deadbeef2", "/foo/bar.go", target, true)
        .await
        .unwrap();
    assert_eq!(out, Some(source));
}

// ═══════════════════════════════════════════════════════════════════════
// Round-trip property
// ═══════════════════════════════════════════════════════════════════════

/// Builds a well-formed hunk list from unchanged gaps and line operations
/// (0 = context, 1 = removed, 2 = added). Returns the hunks and the number
/// of lines on the original side.
fn build_hunks(segments: &[(u32, Vec<u8>)]) -> (Vec<Hunk>, u32) {
    use codeintel_gittree::HunkLine;

    let mut hunks = Vec::new();
    let (mut orig, mut new) = (1u32, 1u32);
    for (gap, ops) in segments {
        orig += gap;
        new += gap;
        let mut hunk = Hunk {
            orig_start: orig,
            orig_len: 0,
            new_start: new,
            new_len: 0,
            lines: Vec::new(),
        };
        for op in ops {
            let kind = match op {
                0 => HunkLine::Context,
                1 => HunkLine::Removed,
                _ => HunkLine::Added,
            };
            if kind != HunkLine::Added {
                hunk.orig_len += 1;
            }
            if kind != HunkLine::Removed {
                hunk.new_len += 1;
            }
            hunk.lines.push(kind);
        }
        orig = hunk.orig_end();
        new = hunk.new_end();
        hunks.push(hunk);
    }
    (hunks, orig + 5)
}

proptest! {
    #[test]
    fn prop_forward_then_reverse_is_identity(
        segments in prop::collection::vec((1u32..8, prop::collection::vec(0u8..3, 1..8)), 0..6),
        character in 0u32..200,
    ) {
        let (hunks, orig_lines) = build_hunks(&segments);
        for line in 0..orig_lines {
            let pos = Position::new(line, character);
            if let Some(moved) = translate_position(&hunks, pos, Direction::Forward) {
                prop_assert_eq!(translate_position(&hunks, moved, Direction::Reverse), Some(pos));
            }
        }
    }

    #[test]
    fn prop_inverted_hunks_match_reverse(
        segments in prop::collection::vec((1u32..8, prop::collection::vec(0u8..3, 1..8)), 0..6),
    ) {
        let (hunks, orig_lines) = build_hunks(&segments);
        let inverted: Vec<Hunk> = hunks.iter().map(Hunk::inverted).collect();
        for line in 0..orig_lines {
            let pos = Position::new(line, 0);
            prop_assert_eq!(
                translate_position(&hunks, pos, Direction::Reverse),
                translate_position(&inverted, pos, Direction::Forward)
            );
        }
    }
}
