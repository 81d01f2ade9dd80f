//! End to end scenarios: a mock Gitiles server, a real cache directory, and
//! direct invocation of the FUSE operations.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use data_encoding::BASE64;
use fuse_backend_rs::api::filesystem::{
    Context, Entry, FileSystem, SetattrValid, ZeroCopyWriter, ROOT_ID,
};
use parking_lot::Mutex;

use crate::cache::{Cache, Options as CacheOptions};
use crate::fixtures;
use crate::fs::{MultiFsOptions, SlothFs};
use crate::gitiles;
use crate::manifest;

#[derive(Clone)]
struct ServerState {
    responses: Arc<HashMap<String, Vec<u8>>>,
    requests: Arc<Mutex<HashMap<String, usize>>>,
}

struct MockGitiles {
    addr: SocketAddr,
    requests: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockGitiles {
    async fn start() -> MockGitiles {
        let mut responses: HashMap<String, Vec<u8>> = HashMap::new();

        let tree_json = format!(")]}}'\n{}", fixtures::TEST_TREE_JSON);
        responses.insert(
            format!(
                "/platform/build/kati/+/{}/?format=JSON&long=1&recursive=1",
                fixtures::COMMIT_HEX
            ),
            tree_json.into_bytes(),
        );
        for name in ["AUTHORS", "AUTHORS2", "AUTHORSx"] {
            responses.insert(
                format!(
                    "/platform/build/kati/+show/{}/{}?format=TEXT",
                    fixtures::COMMIT_HEX,
                    name
                ),
                fixtures::BLOB_CONTENT.clone(),
            );
        }
        responses.insert(
            "/platform/manifest/+show/master/default.xml?format=TEXT".to_string(),
            fixtures::TEST_MANIFEST_XML.as_bytes().to_vec(),
        );
        // a server that forgot the XSS prefix
        responses.insert(
            format!(
                "/broken/+/{}/?format=JSON&long=1&recursive=1",
                fixtures::COMMIT_HEX
            ),
            fixtures::TEST_TREE_JSON.as_bytes().to_vec(),
        );
        responses.insert(
            "/?format=JSON&b=master".to_string(),
            format!(
                ")]}}'\n{{\"platform/build/kati\": {{\"name\": \"platform/build/kati\", \
                 \"clone_url\": \"https://android.googlesource.com/platform/build/kati\", \
                 \"branches\": {{\"master\": \"{}\"}}}}}}\n",
                fixtures::COMMIT_HEX
            )
            .into_bytes(),
        );

        let state = ServerState {
            responses: Arc::new(responses),
            requests: Arc::new(Mutex::new(HashMap::new())),
        };
        let requests = state.requests.clone();

        let app = axum::Router::new().fallback(handler).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock server");
        });

        MockGitiles { addr, requests }
    }

    fn request_count(&self, path: &str) -> usize {
        self.requests.lock().get(path).copied().unwrap_or(0)
    }
}

async fn handler(State(state): State<ServerState>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    let key = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| path.clone());

    *state.requests.lock().entry(path).or_insert(0) += 1;

    match state.responses.get(&key) {
        None => (axum::http::StatusCode::NOT_FOUND, "not found").into_response(),
        Some(body) if key.contains("format=TEXT") => (
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
            BASE64.encode(body),
        )
            .into_response(),
        Some(body) => body.clone().into_response(),
    }
}

struct TestFixture {
    _tmp: tempfile::TempDir,
    server: MockGitiles,
    cache: Arc<Cache>,
    client: Arc<gitiles::Client>,
    fs: Arc<SlothFs>,
    manifest_path: PathBuf,
}

impl TestFixture {
    async fn new() -> TestFixture {
        let tmp = tempfile::tempdir().expect("tempdir");
        let server = MockGitiles::start().await;

        let cache =
            Cache::new(tmp.path().join("cache"), CacheOptions::default()).expect("cache setup");
        let client = gitiles::Client::new(gitiles::Options {
            address: format!("http://{}", server.addr),
            sustained_qps: 500.0,
            ..Default::default()
        })
        .expect("client setup");

        let fs = Arc::new(SlothFs::new(
            cache.clone(),
            client.clone(),
            MultiFsOptions::default(),
        ));

        let manifest_path = tmp.path().join("manifest.xml");
        std::fs::write(&manifest_path, fixtures::TEST_MANIFEST_XML).expect("write manifest");

        TestFixture {
            _tmp: tmp,
            server,
            cache,
            client,
            fs,
            manifest_path,
        }
    }
}

fn ctx() -> Context {
    Context::default()
}

fn cstr(s: &str) -> CString {
    CString::new(s).expect("no NUL in names")
}

fn lookup_path(fs: &SlothFs, path: &str) -> io::Result<Entry> {
    let mut parent = ROOT_ID;
    let mut entry = None;
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        let e = fs.lookup(&ctx(), parent, &cstr(comp))?;
        parent = e.inode;
        entry = Some(e);
    }
    entry.ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Mounts workspace `name` through the config/ symlink protocol.
fn create_workspace(fs: &SlothFs, name: &str, manifest_path: &Path) -> io::Result<Entry> {
    let config = fs.lookup(&ctx(), ROOT_ID, &cstr("config"))?;
    fs.symlink(
        &ctx(),
        &cstr(manifest_path.to_str().unwrap()),
        config.inode,
        &cstr(name),
    )
}

struct CaptureWriter(Vec<u8>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ZeroCopyWriter for CaptureWriter {
    fn write_from(
        &mut self,
        _f: &mut dyn fuse_backend_rs::file_traits::FileReadWriteVolatile,
        _count: usize,
        _off: u64,
    ) -> io::Result<usize> {
        unimplemented!("tests read through the buffered path")
    }

    fn available_bytes(&self) -> usize {
        usize::MAX
    }
}

/// open + read + release of a whole file.
fn read_file(fs: &SlothFs, ino: u64) -> io::Result<Vec<u8>> {
    let (handle, _) = fs.open(&ctx(), ino, libc::O_RDONLY as u32, 0)?;
    let handle = handle.unwrap_or(0);

    let mut out = CaptureWriter(Vec::new());
    fs.read(&ctx(), ino, handle, &mut out, 1 << 20, 0, None, 0)?;
    fs.release(&ctx(), ino, 0, handle, false, false, None)?;
    Ok(out.0)
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_inode_across_workspaces() {
    let fix = TestFixture::new().await;
    let fs = fix.fs.clone();
    let manifest_path = fix.manifest_path.clone();

    tokio::task::spawn_blocking(move || {
        create_workspace(&fs, "m1", &manifest_path).expect("mount m1");
        create_workspace(&fs, "m2", &manifest_path).expect("mount m2");

        let a1 = lookup_path(&fs, "m1/build/kati/AUTHORS").expect("m1 AUTHORS");
        let a2 = lookup_path(&fs, "m1/build/kati/AUTHORS2").expect("m1 AUTHORS2");
        let other_ws = lookup_path(&fs, "m2/build/kati/AUTHORS").expect("m2 AUTHORS");

        // same blob, same execute bit: one inode, within and across
        // workspaces
        assert_eq!(a1.inode, a2.inode);
        assert_eq!(a1.inode, other_ws.inode);

        // different execute bit: distinct inode
        let ax = lookup_path(&fs, "m1/build/kati/AUTHORSx").expect("m1 AUTHORSx");
        assert_ne!(a1.inode, ax.inode);

        let c1 = read_file(&fs, a1.inode).expect("read m1");
        let c2 = read_file(&fs, other_ws.inode).expect("read m2");
        assert_eq!(c1, c2);
        assert_eq!(*fixtures::BLOB_CONTENT, c1);
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn single_flight_fetch() {
    let fix = TestFixture::new().await;
    let fs = fix.fs.clone();
    let manifest_path = fix.manifest_path.clone();

    tokio::task::spawn_blocking(move || {
        create_workspace(&fs, "ws", &manifest_path).expect("mount ws");
        let entry = lookup_path(&fs, "ws/build/kati/AUTHORS").expect("AUTHORS");

        std::thread::scope(|scope| {
            for _ in 0..10 {
                let fs = &fs;
                scope.spawn(move || {
                    let content = read_file(fs, entry.inode).expect("read");
                    assert_eq!(*fixtures::BLOB_CONTENT, content);
                });
            }
        });
    })
    .await
    .unwrap();

    let blob_path = format!(
        "/platform/build/kati/+show/{}/AUTHORS",
        fixtures::COMMIT_HEX
    );
    assert_eq!(1, fix.server.request_count(&blob_path));
}

#[tokio::test(flavor = "multi_thread")]
async fn copyfile_shares_inode_and_linkfile_points_home() {
    let fix = TestFixture::new().await;
    let fs = fix.fs.clone();
    let manifest_path = fix.manifest_path.clone();

    tokio::task::spawn_blocking(move || {
        create_workspace(&fs, "ws", &manifest_path).expect("mount ws");

        let copy = lookup_path(&fs, "ws/build/copydest").expect("copydest");
        let orig = lookup_path(&fs, "ws/build/kati/AUTHORS").expect("AUTHORS");
        assert_eq!(orig.inode, copy.inode);

        let link = lookup_path(&fs, "ws/build/linkdest").expect("linkdest");
        let target = fs.readlink(&ctx(), link.inode).expect("readlink");
        assert_eq!(b"kati/AUTHORS".to_vec(), target);
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn broken_manifest_rejected_synchronously() {
    let fix = TestFixture::new().await;
    let fs = fix.fs.clone();
    let broken = fix._tmp.path().join("broken.xml");
    std::fs::write(&broken, "I am not XML").unwrap();

    tokio::task::spawn_blocking(move || {
        let err = create_workspace(&fs, "ws", &broken).expect_err("must fail");
        assert_eq!(Some(libc::EINVAL), err.raw_os_error());

        // no workspace appeared
        let err = lookup_path(&fs, "ws").expect_err("ws must not exist");
        assert_eq!(Some(libc::ENOENT), err.raw_os_error());
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn workspace_teardown() {
    let fix = TestFixture::new().await;
    let fs = fix.fs.clone();
    let manifest_path = fix.manifest_path.clone();

    tokio::task::spawn_blocking(move || {
        create_workspace(&fs, "ws", &manifest_path).expect("mount ws");
        assert!(lookup_path(&fs, "ws/build/kati/AUTHORS").is_ok());

        let config = fs.lookup(&ctx(), ROOT_ID, &cstr("config")).unwrap();
        fs.unlink(&ctx(), config.inode, &cstr("ws")).expect("unlink");

        let err = lookup_path(&fs, "ws").expect_err("ws must be gone");
        assert_eq!(Some(libc::ENOENT), err.raw_os_error());
        let err = lookup_path(&fs, "config/ws").expect_err("config entry must be gone");
        assert_eq!(Some(libc::ENOENT), err.raw_os_error());
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn config_symlink_roundtrips_manifest() {
    let fix = TestFixture::new().await;
    let fs = fix.fs.clone();
    let manifest_path = fix.manifest_path.clone();

    tokio::task::spawn_blocking(move || {
        create_workspace(&fs, "ws", &manifest_path).expect("mount ws");

        let link = lookup_path(&fs, "config/ws").expect("config entry");
        let target = fs.readlink(&ctx(), link.inode).expect("readlink");
        assert_eq!(b"../ws/.slothfs/manifest.xml".to_vec(), target);

        let xml = lookup_path(&fs, "ws/.slothfs/manifest.xml").expect("manifest.xml");
        let bytes = read_file(&fs, xml.inode).expect("read manifest.xml");
        let roundtripped = manifest::parse(&bytes).expect("mounted manifest parses");
        let original = manifest::parse(fixtures::TEST_MANIFEST_XML.as_bytes()).unwrap();
        assert_eq!(original, roundtripped);
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn mtime_set_and_get() {
    let fix = TestFixture::new().await;
    let fs = fix.fs.clone();
    let manifest_path = fix.manifest_path.clone();

    tokio::task::spawn_blocking(move || {
        create_workspace(&fs, "ws", &manifest_path).expect("mount ws");
        let entry = lookup_path(&fs, "ws/build/kati/AUTHORS").expect("AUTHORS");

        // default is one second past the epoch
        let (attr, _) = fs.getattr(&ctx(), entry.inode, None).unwrap();
        assert_eq!(1, attr.st_mtime);

        let mut new_attr: fuse_backend_rs::abi::fuse_abi::stat64 = unsafe { std::mem::zeroed() };
        new_attr.st_mtime = 1234567;
        new_attr.st_mtime_nsec = 890;
        fs.setattr(&ctx(), entry.inode, new_attr, None, SetattrValid::MTIME)
            .expect("setattr mtime");

        let (attr, _) = fs.getattr(&ctx(), entry.inode, None).unwrap();
        assert_eq!(1234567, attr.st_mtime);
        assert_eq!(890, attr.st_mtime_nsec);

        // anything but the timestamp is refused
        let err = fs
            .setattr(&ctx(), entry.inode, new_attr, None, SetattrValid::MODE)
            .expect_err("mode change must fail");
        assert_eq!(Some(libc::ENOTSUP), err.raw_os_error());
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn gitsha1_xattr() {
    let fix = TestFixture::new().await;
    let fs = fix.fs.clone();
    let manifest_path = fix.manifest_path.clone();

    tokio::task::spawn_blocking(move || {
        use fuse_backend_rs::api::filesystem::{GetxattrReply, ListxattrReply};

        create_workspace(&fs, "ws", &manifest_path).expect("mount ws");
        let entry = lookup_path(&fs, "ws/build/kati/AUTHORS").expect("AUTHORS");

        match fs
            .getxattr(&ctx(), entry.inode, &cstr("user.gitsha1"), 100)
            .expect("getxattr")
        {
            GetxattrReply::Value(v) => {
                assert_eq!(fixtures::BLOB_ID.hex().into_bytes(), v);
            }
            GetxattrReply::Count(_) => panic!("expected value"),
        }

        match fs.listxattr(&ctx(), entry.inode, 100).expect("listxattr") {
            ListxattrReply::Names(names) => assert_eq!(b"user.gitsha1\0".to_vec(), names),
            ListxattrReply::Count(_) => panic!("expected names"),
        }

        let err = match fs.getxattr(&ctx(), entry.inode, &cstr("user.other"), 100) {
            Ok(_) => panic!("unknown attribute"),
            Err(e) => e,
        };
        assert_eq!(Some(libc::ENODATA), err.raw_os_error());
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn composition_failure_yields_error_file() {
    let fix = TestFixture::new().await;
    let fs = fix.fs.clone();

    // copyfile source that does not exist in the tree
    let bad = fix._tmp.path().join("bad.xml");
    let xml = fixtures::TEST_MANIFEST_XML.replace("src=\"AUTHORS\"", "src=\"NOSUCHFILE\"");
    std::fs::write(&bad, xml).unwrap();

    tokio::task::spawn_blocking(move || {
        create_workspace(&fs, "ws", &bad).expect("symlink itself succeeds");

        let err_entry = lookup_path(&fs, "ws/ERROR").expect("ERROR file");
        let content = read_file(&fs, err_entry.inode).expect("read ERROR");
        assert!(
            String::from_utf8_lossy(&content).contains("copyfile"),
            "ERROR mentions the cause"
        );

        // nothing else under the workspace
        let err = lookup_path(&fs, "ws/build").expect_err("no build dir");
        assert_eq!(Some(libc::ENOENT), err.raw_os_error());
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn manifest_dir_persists_and_restores() {
    let fix = TestFixture::new().await;
    let manifest_dir = fix._tmp.path().join("config");

    {
        let fs = Arc::new(SlothFs::new(
            fix.cache.clone(),
            fix.client.clone(),
            MultiFsOptions {
                manifest_dir: Some(manifest_dir.clone()),
                ..Default::default()
            },
        ));
        let manifest_path = fix.manifest_path.clone();
        let fs2 = fs.clone();
        tokio::task::spawn_blocking(move || {
            create_workspace(&fs2, "ws", &manifest_path).expect("mount ws");
        })
        .await
        .unwrap();
        assert!(manifest_dir.join("ws").is_file());
    }

    // a fresh filesystem picks the workspace up again
    let fs = Arc::new(SlothFs::new(
        fix.cache.clone(),
        fix.client.clone(),
        MultiFsOptions {
            manifest_dir: Some(manifest_dir.clone()),
            ..Default::default()
        },
    ));
    fs.configure_workspaces().await.expect("configure");

    let fs2 = fs.clone();
    tokio::task::spawn_blocking(move || {
        assert!(lookup_path(&fs2, "ws/build/kati/AUTHORS").is_ok());

        // unlinking also forgets the persisted manifest
        let config = fs2.lookup(&ctx(), ROOT_ID, &cstr("config")).unwrap();
        fs2.unlink(&ctx(), config.inode, &cstr("ws")).expect("unlink");
    })
    .await
    .unwrap();
    assert!(!manifest_dir.join("ws").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_and_deref_manifest() {
    let fix = TestFixture::new().await;

    let mut mf = crate::populate::fetch_manifest(&fix.client, "platform/manifest", "master")
        .await
        .expect("fetch manifest");
    assert_eq!(1, mf.projects.len());

    // dereference a branch name back to a commit and a clone URL
    mf.projects[0].revision = String::new();
    mf.projects[0].clone_url = String::new();
    crate::populate::deref_manifest(&fix.client, &mut mf)
        .await
        .expect("deref manifest");

    assert_eq!(fixtures::COMMIT_HEX, mf.projects[0].revision);
    assert_eq!(
        "https://android.googlesource.com/platform/build/kati",
        mf.projects[0].clone_url
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_xss_tag_is_a_protocol_error() {
    let fix = TestFixture::new().await;

    let err = fix
        .client
        .repo("broken")
        .get_tree(fixtures::COMMIT_HEX, "", true)
        .await
        .expect_err("response without XSS tag must be rejected");
    assert!(
        matches!(err, crate::Error::Protocol(_)),
        "got {:?}",
        err
    );

    // and such a response must not have been cached
    let rev = crate::GitSha1::from_hex(fixtures::COMMIT_HEX).unwrap();
    assert!(fix.cache.tree.get(&rev).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn blob_fetches_are_cached_in_the_cas() {
    let fix = TestFixture::new().await;
    let fs = fix.fs.clone();
    let manifest_path = fix.manifest_path.clone();

    tokio::task::spawn_blocking(move || {
        create_workspace(&fs, "ws", &manifest_path).expect("mount ws");
        let entry = lookup_path(&fs, "ws/build/kati/AUTHORS").expect("AUTHORS");
        read_file(&fs, entry.inode).expect("read");
        read_file(&fs, entry.inode).expect("read again");
    })
    .await
    .unwrap();

    // the second read was served from disk
    let blob_path = format!(
        "/platform/build/kati/+show/{}/AUTHORS",
        fixtures::COMMIT_HEX
    );
    assert_eq!(1, fix.server.request_count(&blob_path));

    let mut f = fix
        .cache
        .blob
        .open(&fixtures::BLOB_ID)
        .unwrap()
        .expect("blob landed in the cas");
    let mut content = Vec::new();
    std::io::Read::read_to_end(&mut f, &mut content).unwrap();
    assert_eq!(*fixtures::BLOB_CONTENT, content);
}

mod populate_e2e {
    use super::*;
    use crate::populate;

    const H1: &str = "1111111111111111111111111111111111111111";
    const H2: &str = "2222222222222222222222222222222222222222";
    const H3: &str = "3333333333333333333333333333333333333333";
    const H4: &str = "4444444444444444444444444444444444444444";

    fn write_tree_json(dir: &Path, entries: &[(&str, &str)]) {
        let meta = dir.join(".slothfs");
        std::fs::create_dir_all(&meta).unwrap();
        let entries: Vec<serde_json::Value> = entries
            .iter()
            .map(|(name, id)| {
                serde_json::json!({
                    "Mode": 0o100644u32,
                    "Type": "blob",
                    "ID": id,
                    "Name": name,
                    "Size": 1
                })
            })
            .collect();
        let tree = serde_json::json!({"ID": H1, "Entries": entries});
        std::fs::write(meta.join("tree.json"), serde_json::to_vec(&tree).unwrap()).unwrap();
    }

    fn write_manifest(dir: &Path, projects: &[&str]) {
        let meta = dir.join(".slothfs");
        std::fs::create_dir_all(&meta).unwrap();
        let mut xml = String::from("<manifest>\n  <default revision=\"master\" remote=\"r\" sync-j=\"4\" />\n");
        for p in projects {
            xml.push_str(&format!(
                "  <project name=\"{}\" path=\"{}\" revision=\"{}\" />\n",
                p, p, H1
            ));
        }
        xml.push_str("</manifest>\n");
        std::fs::write(meta.join("manifest.xml"), xml).unwrap();
        // the workspace root carries an empty tree record
        std::fs::write(
            meta.join("tree.json"),
            serde_json::to_vec(&crate::gitiles::Tree::default()).unwrap(),
        )
        .unwrap();
    }

    /// Fabricates a workspace snapshot the way the filesystem presents one.
    fn make_snapshot(mount: &Path, name: &str, projects: &[(&str, &[(&str, &str)])]) -> PathBuf {
        let root = mount.join(name);
        let names: Vec<&str> = projects.iter().map(|(n, _)| *n).collect();
        write_manifest(&root, &names);
        for (project, entries) in projects {
            let pdir = root.join(project);
            std::fs::create_dir_all(&pdir).unwrap();
            write_tree_json(&pdir, entries);
            for (file, _) in *entries {
                let f = pdir.join(file);
                std::fs::create_dir_all(f.parent().unwrap()).unwrap();
                std::fs::write(f, b"x").unwrap();
            }
        }
        root
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn diff_between_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = tmp.path().join("mnt");
        let rw = tmp.path().join("rw");
        std::fs::create_dir_all(&rw).unwrap();

        let snap_a = make_snapshot(
            &mount,
            "A",
            &[("project", &[("a", H1), ("b/c", H2)])],
        );
        let snap_b = make_snapshot(
            &mount,
            "B",
            &[
                ("project", &[("a", H3), ("b/c", H2), ("new", H4)]),
                ("sub", &[("d", H4)]),
            ],
        );

        let (added, changed) = populate::checkout(&snap_a, &rw).await.expect("first run");
        assert_eq!(Vec::<String>::new(), changed);
        assert!(!added.is_empty(), "fresh checkout counts as added");

        let (added, changed) = populate::checkout(&snap_b, &rw).await.expect("second run");
        assert_eq!(
            vec![
                snap_b.join("project/new").to_string_lossy().to_string(),
                snap_b.join("sub/d").to_string_lossy().to_string(),
            ],
            added
        );
        assert_eq!(
            vec![snap_b.join("project/a").to_string_lossy().to_string()],
            changed
        );

        // the forest now points into B
        let link = rw.join("project");
        assert_eq!(
            snap_b.join("project"),
            std::fs::read_link(&link).expect("project is a symlink")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn populate_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = tmp.path().join("mnt");
        let rw = tmp.path().join("rw");
        std::fs::create_dir_all(&rw).unwrap();

        let snap = make_snapshot(&mount, "A", &[("project", &[("a", H1)])]);

        populate::checkout(&snap, &rw).await.expect("first run");
        let (added, changed) = populate::checkout(&snap, &rw).await.expect("second run");
        assert_eq!(Vec::<String>::new(), added);
        assert_eq!(Vec::<String>::new(), changed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rw_checkout_shadows_project() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = tmp.path().join("mnt");
        let rw = tmp.path().join("rw");

        let snap = make_snapshot(
            &mount,
            "A",
            &[
                ("project", &[("a", H1)]),
                ("other", &[("f", H2)]),
            ],
        );

        // the user has a writable git checkout at project/
        std::fs::create_dir_all(rw.join("project/.git")).unwrap();
        std::fs::write(rw.join("project/mine"), b"local").unwrap();

        populate::checkout(&snap, &rw).await.expect("populate");

        // the checkout is untouched, and not shadowed by a bulk link
        assert!(rw.join("project/.git").is_dir());
        assert!(rw.join("project/mine").is_file());
        assert!(!rw.join("project").is_symlink());

        // the absent project is bulk linked
        assert_eq!(
            snap.join("other"),
            std::fs::read_link(rw.join("other")).expect("other is a symlink")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn broken_previous_link_is_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = tmp.path().join("mnt");
        let rw = tmp.path().join("rw");
        std::fs::create_dir_all(&rw).unwrap();

        let snap = make_snapshot(&mount, "A", &[("project", &[("a", H1)])]);

        // a dangling link into a workspace that no longer exists
        std::os::unix::fs::symlink(mount.join("gone/project/x"), rw.join("stale")).unwrap();

        let (_, changed) = populate::checkout(&snap, &rw).await.expect("populate");
        assert_eq!(Vec::<String>::new(), changed);
        assert!(!rw.join("stale").exists());
    }
}
