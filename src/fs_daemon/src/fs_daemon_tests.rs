use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fuser::FileType;
use libc::{EEXIST, EINVAL, ENOENT, ENOTDIR, ENOTEMPTY};
use tokio::runtime::Runtime;

use colfs_lib::MountConfig;
use fs_store::{body_hash, DbSession, DbSessionRef, FileStore, MemSession};

use crate::fs_daemon::{load_config, ColFs, ConfigOverrides, RootAttrs, RunOptions};

fn create_test_fs() -> (ColFs, Arc<MemSession>) {
    let runtime = Runtime::new().expect("create runtime");
    let session = Arc::new(MemSession::new());
    let config = MountConfig {
        fcache_ttl_secs: 0,
        ..Default::default()
    };
    let session_ref: DbSessionRef = session.clone();
    let store = Arc::new(FileStore::new(session_ref, &config));
    let root = RootAttrs {
        uid: 1000,
        gid: 1000,
        mode: 0o40755,
    };
    let fs = ColFs::new(runtime, store, root, Duration::from_secs(1));
    (fs, session)
}

fn block_on<T>(future: impl std::future::Future<Output = T>) -> T {
    Runtime::new().expect("create runtime").block_on(future)
}

#[test]
fn test_root_attributes_come_from_mount_options() {
    let (fs, _session) = create_test_fs();
    let (ino, attr) = fs.getattr_entry(1).expect("root getattr");
    assert_eq!(ino, 1);
    assert_eq!(attr.kind, FileType::Directory);
    assert_eq!(attr.perm, 0o755);
    assert_eq!(attr.uid, 1000);
}

#[test]
fn test_create_write_reopen() {
    let (fs, _session) = create_test_fs();
    let (_attr, fh) = fs
        .create_file_op(1, "a.txt", 0o644, 1000, 1000)
        .expect("create a.txt");
    assert_eq!(fs.write_op(fh, 0, b"hello world").expect("write"), 11);
    fs.flush_op(fh).expect("flush");
    fs.release_op(fh).expect("release");

    let (ino, attr) = fs.lookup_entry(1, "a.txt").expect("lookup a.txt");
    assert_eq!(attr.size, 11);
    let fh = fs.open_file_op(ino).expect("reopen");
    assert_eq!(fs.read_op(fh, 0, 11).expect("read"), b"hello world");
    fs.release_op(fh).expect("release");
}

#[test]
fn test_sparse_write_zero_fills() {
    let (fs, _session) = create_test_fs();
    let (_attr, fh) = fs
        .create_file_op(1, "s.bin", 0o644, 1000, 1000)
        .expect("create s.bin");
    fs.write_op(fh, 4, b"X").expect("write");
    assert_eq!(fs.read_op(fh, 0, 5).expect("read"), b"\0\0\0\0X");
    fs.release_op(fh).expect("release");
    let (_ino, attr) = fs.lookup_entry(1, "s.bin").expect("lookup s.bin");
    assert_eq!(attr.size, 5);
}

#[test]
fn test_create_refuses_existing_and_lookup_missing() {
    let (fs, _session) = create_test_fs();
    let (_attr, fh) = fs
        .create_file_op(1, "f", 0o644, 1000, 1000)
        .expect("create f");
    fs.release_op(fh).expect("release");
    assert_eq!(fs.create_file_op(1, "f", 0o644, 1000, 1000).unwrap_err(), EEXIST);
    assert_eq!(fs.lookup_entry(1, "ghost").unwrap_err(), ENOENT);
}

#[test]
fn test_link_unlink_and_ref_count() {
    let (fs, session) = create_test_fs();
    let (_attr, fh) = fs
        .create_file_op(1, "f", 0o644, 1000, 1000)
        .expect("create f");
    fs.write_op(fh, 0, b"data").expect("write");
    fs.flush_op(fh).expect("flush");
    fs.release_op(fh).expect("release");

    let (ino, _attr) = fs.lookup_entry(1, "f").expect("lookup f");
    fs.link_op(ino, 1, "g").expect("link f g");
    fs.unlink_path(1, "f").expect("unlink f");
    assert_eq!(fs.lookup_entry(1, "f").unwrap_err(), ENOENT);

    let (g_ino, _attr) = fs.lookup_entry(1, "g").expect("lookup g");
    let fh = fs.open_file_op(g_ino).expect("open g");
    assert_eq!(fs.read_op(fh, 0, 4).expect("read"), b"data");
    fs.release_op(fh).expect("release");

    let refs = block_on(async { session.read_refs(&body_hash(b"data")).await.unwrap() });
    assert_eq!(refs, 1);
}

#[test]
fn test_directory_lifecycle() {
    let (fs, _session) = create_test_fs();
    fs.mkdir_path(1, "d", 0o755, 1000, 1000).expect("mkdir d");
    let (d_ino, attr) = fs.lookup_entry(1, "d").expect("lookup d");
    assert_eq!(attr.kind, FileType::Directory);

    let (_attr, fh) = fs
        .create_file_op(d_ino, "x", 0o644, 1000, 1000)
        .expect("create d/x");
    fs.release_op(fh).expect("release");

    assert_eq!(fs.rmdir_path(1, "d").unwrap_err(), ENOTEMPTY);
    fs.unlink_path(d_ino, "x").expect("unlink d/x");
    fs.rmdir_path(1, "d").expect("rmdir d");
    assert_eq!(fs.lookup_entry(1, "d").unwrap_err(), ENOENT);
}

#[test]
fn test_rmdir_of_file_is_enotdir() {
    let (fs, _session) = create_test_fs();
    let (_attr, fh) = fs
        .create_file_op(1, "f", 0o644, 1000, 1000)
        .expect("create f");
    fs.release_op(fh).expect("release");
    assert_eq!(fs.rmdir_path(1, "f").unwrap_err(), ENOTDIR);
}

#[test]
fn test_symlink_round_trip() {
    let (fs, _session) = create_test_fs();
    fs.symlink_op(1, "link", "/target", 1000, 1000).expect("symlink");
    let (ino, attr) = fs.lookup_entry(1, "link").expect("lookup link");
    assert_eq!(attr.kind, FileType::Symlink);
    assert_eq!(fs.readlink_op(ino).expect("readlink"), b"/target");
}

#[test]
fn test_rename_file() {
    let (fs, _session) = create_test_fs();
    let (_attr, fh) = fs
        .create_file_op(1, "old.txt", 0o644, 1000, 1000)
        .expect("create old");
    fs.release_op(fh).expect("release");

    fs.rename_op(1, "old.txt", 1, "new.txt").expect("rename");
    assert_eq!(fs.lookup_entry(1, "old.txt").unwrap_err(), ENOENT);
    assert!(fs.lookup_entry(1, "new.txt").is_ok());
    assert_eq!(fs.rename_op(1, "gone", 1, "x").unwrap_err(), ENOENT);
}

#[test]
fn test_recreated_directory_resolves_again() {
    let (fs, _session) = create_test_fs();
    fs.mkdir_path(1, "d", 0o755, 1000, 1000).expect("mkdir d");
    let (d_ino, _attr) = fs.lookup_entry(1, "d").expect("lookup d");
    let (_attr, fh) = fs
        .create_file_op(d_ino, "x", 0o644, 1000, 1000)
        .expect("create d/x");
    fs.release_op(fh).expect("release");
    fs.unlink_path(d_ino, "x").expect("unlink d/x");
    fs.rmdir_path(1, "d").expect("rmdir d");

    // same path, different UUID; the resolver must not serve the old id
    fs.mkdir_path(1, "d", 0o755, 1000, 1000).expect("mkdir d again");
    let (d_ino, _attr) = fs.lookup_entry(1, "d").expect("lookup d again");
    let (_attr, fh) = fs
        .create_file_op(d_ino, "y", 0o644, 1000, 1000)
        .expect("create d/y");
    fs.release_op(fh).expect("release");
    assert!(fs.lookup_entry(d_ino, "y").is_ok());
    let entries = fs.readdir_entries(d_ino, 0).expect("readdir d");
    let names: Vec<String> = entries.into_iter().map(|e| e.2).collect();
    assert!(names.contains(&"y".to_string()));
    assert!(!names.contains(&"x".to_string()));
}

#[test]
fn test_readdir_lists_children() {
    let (fs, _session) = create_test_fs();
    fs.mkdir_path(1, "dir", 0o755, 1000, 1000).expect("mkdir");
    let (_attr, fh) = fs
        .create_file_op(1, "file", 0o644, 1000, 1000)
        .expect("create file");
    fs.release_op(fh).expect("release");

    let entries = fs.readdir_entries(1, 0).expect("readdir");
    let names: Vec<String> = entries.into_iter().map(|e| e.2).collect();
    assert!(names.contains(&".".to_string()));
    assert!(names.contains(&"..".to_string()));
    assert!(names.contains(&"dir".to_string()));
    assert!(names.contains(&"file".to_string()));
}

#[test]
fn test_setattr_chmod_chown_on_path() {
    let (fs, _session) = create_test_fs();
    let (_attr, fh) = fs
        .create_file_op(1, "f", 0o644, 1000, 1000)
        .expect("create f");
    fs.release_op(fh).expect("release");
    let (ino, _attr) = fs.lookup_entry(1, "f").expect("lookup f");

    let attr = fs
        .setattr_entry(ino, Some(0o600), Some(0), None, None, None, None, None)
        .expect("setattr");
    assert_eq!(attr.perm, 0o600);
    assert_eq!(attr.uid, 0);
    assert_eq!(attr.gid, 1000);
    assert_eq!(attr.kind, FileType::RegularFile);
}

#[test]
fn test_truncate_needs_a_handle() {
    let (fs, _session) = create_test_fs();
    let (_attr, fh) = fs
        .create_file_op(1, "f", 0o644, 1000, 1000)
        .expect("create f");
    fs.write_op(fh, 0, b"abcdef").expect("write");
    let (ino, _attr) = fs.lookup_entry(1, "f").expect("lookup f");

    // path-level truncate is unsupported
    assert_eq!(
        fs.setattr_entry(ino, None, None, None, Some(0), None, None, None)
            .unwrap_err(),
        EINVAL
    );
    // handle truncate shrinks only
    let attr = fs
        .setattr_entry(ino, None, None, None, Some(3), None, None, Some(fh))
        .expect("ftruncate");
    assert_eq!(attr.size, 3);
    assert_eq!(
        fs.setattr_entry(ino, None, None, None, Some(9), None, None, Some(fh))
            .unwrap_err(),
        EINVAL
    );
    fs.release_op(fh).expect("release");
}

#[test]
fn test_setattr_on_root_updates_mount_options() {
    let (fs, _session) = create_test_fs();
    let attr = fs
        .setattr_entry(1, Some(0o700), Some(0), Some(0), None, None, None, None)
        .expect("setattr root");
    assert_eq!(attr.perm, 0o700);
    assert_eq!(attr.uid, 0);
    assert_eq!(attr.gid, 0);
    let (_ino, attr) = fs.getattr_entry(1).expect("root getattr");
    assert_eq!(attr.perm, 0o700);
}

#[test]
fn test_statfs_counts_rows() {
    let (fs, _session) = create_test_fs();
    fs.mkdir_path(1, "d", 0o755, 1000, 1000).expect("mkdir");
    let (_attr, fh) = fs
        .create_file_op(1, "f", 0o644, 1000, 1000)
        .expect("create f");
    fs.release_op(fh).expect("release");
    assert_eq!(fs.statfs_op().expect("statfs"), 2);
}

#[test]
fn test_load_config_rejects_bad_ttls() {
    let options = |overrides: ConfigOverrides| RunOptions {
        mountpoint: PathBuf::from("/mnt"),
        config_path: None,
        overrides,
    };

    for entry_ttl in [f64::INFINITY, f64::NAN, -1.0, 1e300] {
        let bad = options(ConfigOverrides {
            entry_ttl_secs: Some(entry_ttl),
            ..Default::default()
        });
        assert!(load_config(&bad).is_err(), "accepted entry_ttl {}", entry_ttl);
    }

    let bad = options(ConfigOverrides {
        negative_ttl_secs: Some(f64::INFINITY),
        ..Default::default()
    });
    assert!(load_config(&bad).is_err());

    let good = options(ConfigOverrides {
        entry_ttl_secs: Some(0.5),
        negative_ttl_secs: Some(0.0),
        ..Default::default()
    });
    assert!(load_config(&good).is_ok());
}

#[test]
fn test_two_handles_last_writer_wins() {
    let (fs, _session) = create_test_fs();
    let (_attr, first) = fs
        .create_file_op(1, "f", 0o644, 1000, 1000)
        .expect("create f");
    fs.write_op(first, 0, b"first").expect("write first");
    let (ino, _attr) = fs.lookup_entry(1, "f").expect("lookup f");
    let second = fs.open_file_op(ino).expect("open second");
    fs.write_op(second, 0, b"second").expect("write second");
    // both handles share one record
    assert_eq!(fs.read_op(first, 0, 64).expect("read"), b"second");
    fs.release_op(first).expect("release first");
    fs.release_op(second).expect("release second");
    let (_ino, attr) = fs.lookup_entry(1, "f").expect("lookup f");
    assert_eq!(attr.size, 6);
}
