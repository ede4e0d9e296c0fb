//! Integration tests for the safe path algebra (spec §4.9, component
//! C9), covering scenarios beyond what `path.rs`'s own doctests and
//! unit tests already exercise: multi-segment escapes, trailing-slash
//! edge cases, and `join`/`strip_prefix` round trips across directory
//! boundaries.

use mgmtd::httpcache::path::{AbsoluteDir, AbsoluteFile, PathError, RelativeFile};

#[test]
fn a_deeply_nested_escape_is_still_rejected() {
    let dir = AbsoluteDir::parse("/var/cache/mirror/").unwrap();
    let err = dir.strip_prefix("/var/cache/mirror/a/b/../../../etc/passwd").unwrap_err();
    assert_eq!(err, PathError::Escapes);
}

#[test]
fn dot_segments_that_stay_inside_the_directory_are_fine() {
    let dir = AbsoluteDir::parse("/mirror/").unwrap();
    let rel = dir.strip_prefix("/mirror/a/../b/c.txt").unwrap();
    assert_eq!(rel.to_string(), "b/c.txt");
}

#[test]
fn root_directory_has_no_parent() {
    let root = AbsoluteDir::parse("/").unwrap();
    assert_eq!(root.as_str(), "/");
    assert!(root.parent().is_none());
}

#[test]
fn a_bare_slash_leaf_has_no_parent_directory() {
    assert!(AbsoluteDir::parent_of("/").is_none());
}

#[test]
fn join_then_strip_prefix_round_trips() {
    let dir = AbsoluteDir::parse("/srv/www").unwrap(); // missing trailing slash tolerated
    let rel = RelativeFile::parse("images/logo.png").unwrap();
    let file = dir.join(&rel).unwrap();
    assert_eq!(file.as_str(), "/srv/www/images/logo.png");

    let stripped = dir.strip_prefix(file.as_str()).unwrap();
    assert_eq!(stripped, rel);
}

#[test]
fn join_rejects_a_relative_path_that_would_climb_above_the_base() {
    let dir = AbsoluteDir::parse("/srv/www/").unwrap();
    // RelativeFile itself rejects a leading ".." at parse time, so the
    // only way `join` sees an escape is a relative value built from a
    // string with enough internal ".." to climb past the base once
    // joined — which `normalize_segments` also refuses to construct.
    assert!(RelativeFile::parse("../outside").is_err());
}

#[test]
fn absolute_file_rejects_the_root_itself() {
    assert_eq!(
        AbsoluteFile::parse("/").unwrap_err(),
        PathError::NotAbsolute("/ is a directory".to_string())
    );
}

#[test]
fn a_directory_with_only_dot_segments_normalizes_to_root() {
    let dir = AbsoluteDir::parse("/a/../b/..").unwrap();
    assert_eq!(dir.as_str(), "/");
}

#[test]
fn has_prefix_of_does_not_match_a_sibling_with_a_shared_string_prefix() {
    let dir = AbsoluteDir::parse("/mirror/").unwrap();
    assert!(!dir.has_prefix_of("/mirror-backup/x"));
}

#[test]
fn nul_byte_is_rejected_everywhere() {
    assert_eq!(AbsoluteDir::parse("/a/\0/b").unwrap_err(), PathError::NulByte);
    assert_eq!(AbsoluteFile::parse("/a/\0").unwrap_err(), PathError::NulByte);
    assert_eq!(RelativeFile::parse("a/\0").unwrap_err(), PathError::NulByte);
}
