use ferry_core::{EntryKind, LocalFs, WalkConfig};
use ferry_walk::FileWalker;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

fn build_tree(root: &std::path::Path) {
    fs::create_dir_all(root.join("docs/drafts")).unwrap();
    fs::create_dir_all(root.join("media")).unwrap();
    fs::create_dir_all(root.join("void")).unwrap();
    fs::write(root.join("docs/readme.md"), vec![b'r'; 12]).unwrap();
    fs::write(root.join("docs/drafts/v1.md"), vec![b'v'; 5]).unwrap();
    fs::write(root.join("media/clip.bin"), vec![0u8; 2048]).unwrap();
    fs::write(root.join("top.txt"), b"top").unwrap();
}

#[test]
fn test_rewalk_is_identical() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("tree");
    build_tree(&root);

    let walker = FileWalker::new(Arc::new(LocalFs), WalkConfig::default()).unwrap();
    let first: Vec<_> = walker.walk([&root]).map(|r| r.unwrap().path).collect();
    let second: Vec<_> = walker.walk([&root]).map(|r| r.unwrap().path).collect();

    assert_eq!(first, second);
    assert_eq!(
        first,
        vec![
            PathBuf::from("tree/docs/drafts/v1.md"),
            PathBuf::from("tree/docs/readme.md"),
            PathBuf::from("tree/media/clip.bin"),
            PathBuf::from("tree/top.txt"),
            PathBuf::from("tree/void"),
        ]
    );
}

#[test]
fn test_multiple_roots_keep_request_order() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("tree");
    build_tree(&root);

    let walker = FileWalker::new(Arc::new(LocalFs), WalkConfig::default()).unwrap();
    let expansion = walker.expand([root.join("top.txt"), root.join("media")]);

    let names: Vec<_> = expansion.entries.iter().map(|e| e.path.clone()).collect();
    assert_eq!(
        names,
        vec![PathBuf::from("top.txt"), PathBuf::from("media/clip.bin")]
    );
    assert_eq!(expansion.entries[1].size, 2048);
    assert_eq!(expansion.entries[1].kind, EntryKind::File);
    assert_eq!(expansion.entries[1].absolute, root.join("media/clip.bin"));
}

#[test]
fn test_max_depth_limits_expansion() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("tree");
    build_tree(&root);

    let config = WalkConfig::builder().max_depth(Some(1u32)).build().unwrap();
    let walker = FileWalker::new(Arc::new(LocalFs), config).unwrap();
    let expansion = walker.expand([&root]);

    let names: Vec<_> = expansion.entries.iter().map(|e| e.name.to_string()).collect();
    assert_eq!(names, vec!["top.txt".to_string()]);
}
