//! End-to-end sharing tests: two instances in one process, linked by the
//! in-process peer transport.

use std::{future::Future, sync::Arc, time::Duration};

use serde_json::{json, Value};

use cozy_core::{
	couch::{self, revision, MemStore, Store, FILES},
	job::{JobSystem, TriggerInfos, WorkerConfig, WorkerFunc},
	realtime::Verb,
	sharing::{
		self, find_sharing, replicator, upload::FileDocWithRevisions, LocalPeerClient,
		MemberStatus, Rule, Sharing,
	},
	vfs::{self, store::MemObjectStore, trash, DirDoc, FileDoc, FileHandle, Vfs},
	Config, Env, Instance, InstanceOpts, InstanceSettings,
};

struct World {
	env: Arc<Env>,
	jobs: Arc<JobSystem>,
	peer: Arc<LocalPeerClient>,
}

fn world() -> World {
	world_with_extra_workers(Vec::new())
}

fn world_with_extra_workers(extra: Vec<(WorkerConfig, WorkerFunc)>) -> World {
	let mut config = Config::default();
	config.poll_interval = Duration::from_millis(100);
	let env = Env::new(config);
	let peer = LocalPeerClient::new();
	let mut workers = sharing::workers(peer.clone());
	workers.extend(extra);
	let jobs = JobSystem::start(workers, env.config.poll_interval);
	World { env, jobs, peer }
}

async fn open(world: &World, domain: &str, quota: u64) -> Arc<Instance> {
	let instance = Instance::open(
		InstanceOpts {
			domain: domain.to_owned(),
			url: String::new(),
			quota,
			store: Arc::new(MemStore::new()),
			objects: Some(Arc::new(MemObjectStore::new())),
			settings: InstanceSettings {
				public_name: domain.split('.').next().unwrap_or(domain).to_owned(),
				email: format!("contact@{domain}"),
			},
		},
		world.env.clone(),
		world.jobs.clone(),
	)
	.await
	.expect("instance opens");
	world.peer.register(instance.clone()).await;
	instance
}

async fn eventually<F, Fut>(what: &str, mut probe: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
	loop {
		if probe().await {
			return;
		}
		if tokio::time::Instant::now() > deadline {
			panic!("timed out waiting for: {what}");
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
}

async fn mkdir(instance: &Arc<Instance>, parent_id: &str, name: &str) -> DirDoc {
	let fs = instance.vfs();
	let parent = fs.dir_by_id(parent_id).await.expect("parent exists");
	let mut dir = DirDoc::new_with_parent(name, &parent).expect("valid name");
	fs.create_dir(&mut dir).await.expect("dir created");
	dir
}

async fn write_file(
	instance: &Arc<Instance>,
	dir_id: &str,
	name: &str,
	content: &[u8],
	old: Option<FileDoc>,
) -> FileDoc {
	let fs = instance.vfs();
	let doc = FileDoc::new(
		name,
		dir_id,
		0,
		String::new(),
		String::new(),
		String::new(),
		false,
	)
	.expect("valid file doc");
	let mut handle = fs.create_file(doc, old).await.expect("file handle");
	handle.write(content).await.expect("content written");
	handle.close().await.expect("file committed")
}

async fn read_file(instance: &Arc<Instance>, file: &FileDoc) -> Vec<u8> {
	use tokio::io::AsyncReadExt;
	let mut reader = instance.vfs().open_file(file).await.expect("file opens");
	let mut buf = Vec::new();
	reader.read_to_end(&mut buf).await.expect("file reads");
	buf
}

/// Creates `/Docs` on the owner, shares it with the recipient and waits
/// for the recipient to accept. Returns the sharing id and the owner-side
/// directory.
async fn share_docs_dir(
	world: &World,
	owner: &Arc<Instance>,
	recipient: &Arc<Instance>,
	read_only: bool,
) -> (String, DirDoc) {
	let dir = mkdir(owner, vfs::ROOT_DIR_ID, "Docs").await;
	let mut s = Sharing::new("Docs", vec![Rule::files_by_id("Docs", &dir.doc_id)]);
	s.be_owner(owner, "drive");
	s.add_recipient(&format!("contact@{}", recipient.domain), &recipient.url, read_only);
	s.create(owner).await.expect("sharing created");
	s.invite_members(owner, world.peer.as_ref())
		.await
		.expect("members invited");

	let mut on_recipient = find_sharing(recipient, &s.doc_id)
		.await
		.expect("request landed on the recipient");
	on_recipient
		.accept(recipient, world.peer.as_ref())
		.await
		.expect("sharing accepted");
	(s.doc_id.clone(), dir)
}

async fn recipient_file_by_path(instance: &Arc<Instance>, path: &str) -> Option<FileDoc> {
	instance.vfs().file_by_path(path).await.ok()
}

#[tokio::test(flavor = "multi_thread")]
async fn file_create_and_sync() {
	let world = world();
	let alice = open(&world, "alice.example.net", 0).await;
	let bob = open(&world, "bob.example.net", 0).await;
	let (sharing_id, dir) = share_docs_dir(&world, &alice, &bob, false).await;

	let created = write_file(&alice, &dir.doc_id, "hello.txt", b"hello, world", None).await;
	assert_eq!(created.byte_size, 12);

	eventually("the file lands on bob", || async {
		recipient_file_by_path(&bob, "/Shared with me/Docs/hello.txt")
			.await
			.is_some()
	})
	.await;

	let received = recipient_file_by_path(&bob, "/Shared with me/Docs/hello.txt")
		.await
		.unwrap();
	assert_eq!(received.byte_size, created.byte_size);
	assert_eq!(received.md5sum, created.md5sum);
	assert_eq!(read_file(&bob, &received).await, b"hello, world");

	// Bob's shared index marks the file as binary.
	let shared_ref = sharing::shared::get_shared_ref(bob.store.as_ref(), FILES, &received.doc_id)
		.await
		.unwrap()
		.expect("shared index entry exists");
	assert!(shared_ref.infos[&sharing_id].binary);

	// The owner's replication cursor advanced.
	let s = find_sharing(&alice, &sharing_id).await.unwrap();
	eventually("the upload cursor advances", || async {
		test_last_seq(&alice, &s, "upload").await > 0
	})
	.await;
}

async fn test_last_seq(owner: &Arc<Instance>, s: &Sharing, kind: &str) -> u64 {
	let member = &s.members[1];
	let host = member
		.instance
		.trim_end_matches('/')
		.replace("://", "_")
		.replace('/', "_");
	let id = format!("{}/{host}/{kind}", s.doc_id);
	owner
		.store
		.get(couch::MEMBER_SEQS, &id)
		.await
		.ok()
		.and_then(|doc| doc.get("seq").and_then(Value::as_u64))
		.unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_only_rename_converges() {
	let world = world();
	let alice = open(&world, "alice.example.net", 0).await;
	let bob = open(&world, "bob.example.net", 0).await;
	let (_, dir) = share_docs_dir(&world, &alice, &bob, false).await;

	let created = write_file(&alice, &dir.doc_id, "hello.txt", b"same content", None).await;
	eventually("the file lands on bob", || async {
		recipient_file_by_path(&bob, "/Shared with me/Docs/hello.txt")
			.await
			.is_some()
	})
	.await;

	// Rename on the owner: phase-1 metadata is enough, no binary moves.
	let fresh = alice.vfs().file_by_id(&created.doc_id).await.unwrap();
	vfs::file::modify_file_metadata(
		alice.vfs().as_ref(),
		&fresh,
		vfs::directory::DocPatch {
			name: Some("hi.txt".to_owned()),
			..Default::default()
		},
	)
	.await
	.expect("renamed");

	eventually("the rename lands on bob", || async {
		recipient_file_by_path(&bob, "/Shared with me/Docs/hi.txt")
			.await
			.is_some()
	})
	.await;
	let renamed = recipient_file_by_path(&bob, "/Shared with me/Docs/hi.txt")
		.await
		.unwrap();
	assert_eq!(renamed.md5sum, created.md5sum);
	assert!(
		recipient_file_by_path(&bob, "/Shared with me/Docs/hello.txt")
			.await
			.is_none()
	);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_edit_keeps_winner_and_conflict_copy() {
	let world = world();
	let alice = open(&world, "alice.example.net", 0).await;
	let bob = open(&world, "bob.example.net", 0).await;
	// Bob is read-only: his local edits stay local, which lets both sides
	// diverge deterministically.
	let (_, dir) = share_docs_dir(&world, &alice, &bob, true).await;

	write_file(&alice, &dir.doc_id, "hi.txt", b"base", None).await;
	eventually("the file lands on bob", || async {
		recipient_file_by_path(&bob, "/Shared with me/Docs/hi.txt")
			.await
			.is_some()
	})
	.await;

	// Concurrent edits from the same revision.
	let on_bob = recipient_file_by_path(&bob, "/Shared with me/Docs/hi.txt")
		.await
		.unwrap();
	let bob_dir_id = on_bob.dir_id.clone();
	let bob_edit = write_file(&bob, &bob_dir_id, "hi.txt", b"from bob", Some(on_bob)).await;
	let on_alice = alice.vfs().file_by_path("/Docs/hi.txt").await.unwrap();
	let alice_edit =
		write_file(&alice, &dir.doc_id, "hi.txt", b"from alice", Some(on_alice)).await;

	// Alice's push reaches bob and resolves the conflict there.
	eventually("bob resolves the conflict", || async {
		let children = bob_docs_children(&bob).await;
		children.iter().any(|c| c.name().contains("(conflict "))
	})
	.await;

	let winner_is_alice =
		revision::compare(&alice_edit.doc_rev, &bob_edit.doc_rev) == std::cmp::Ordering::Greater;
	let (winner_bytes, loser_bytes): (&[u8], &[u8]) = if winner_is_alice {
		(b"from alice", b"from bob")
	} else {
		(b"from bob", b"from alice")
	};

	let at_path = recipient_file_by_path(&bob, "/Shared with me/Docs/hi.txt")
		.await
		.expect("hi.txt still exists on bob");
	assert_eq!(read_file(&bob, &at_path).await, winner_bytes);

	let children = bob_docs_children(&bob).await;
	let conflict = children
		.iter()
		.find_map(|c| match c {
			vfs::DirOrFile::File(f) if f.name.contains("(conflict ") => Some(f.clone()),
			_ => None,
		})
		.expect("a conflict copy exists");
	assert!(conflict.name.starts_with("hi (conflict "));
	assert!(conflict.name.ends_with(".txt"));
	assert_eq!(read_file(&bob, &conflict).await, loser_bytes);

	// Read-only law: bob's local edit produced no traffic back to alice.
	tokio::time::sleep(Duration::from_millis(500)).await;
	let on_alice = alice.vfs().file_by_path("/Docs/hi.txt").await.unwrap();
	assert_eq!(read_file(&alice, &on_alice).await, b"from alice");
}

async fn bob_docs_children(bob: &Arc<Instance>) -> Vec<vfs::DirOrFile> {
	let dir = bob
		.vfs()
		.dir_by_path("/Shared with me/Docs")
		.await
		.expect("bob's sharing dir exists");
	bob.vfs().dir_children(&dir).await.expect("children listed")
}

#[tokio::test(flavor = "multi_thread")]
async fn recipient_revokes_itself() {
	let world = world();
	let alice = open(&world, "alice.example.net", 0).await;
	let bob = open(&world, "bob.example.net", 0).await;
	let (sharing_id, dir) = share_docs_dir(&world, &alice, &bob, false).await;

	write_file(&alice, &dir.doc_id, "hello.txt", b"hello", None).await;
	eventually("the file lands on bob", || async {
		recipient_file_by_path(&bob, "/Shared with me/Docs/hello.txt")
			.await
			.is_some()
	})
	.await;

	sharing::revoke_recipient_by_self(&bob, world.peer.as_ref(), &sharing_id, false)
		.await
		.expect("bob leaves the sharing");

	// Bob side: inactive, no triggers, shared dir out of the way.
	let on_bob = find_sharing(&bob, &sharing_id).await.unwrap();
	assert!(!on_bob.active);
	assert!(world
		.jobs
		.scheduler
		.get_all_triggers(&bob, None)
		.await
		.is_empty());
	assert!(bob.vfs().dir_by_path("/Shared with me/Docs").await.is_err());

	// Alice side: the member flipped to revoked and pushes stopped.
	eventually("alice sees the revocation", || async {
		let s = find_sharing(&alice, &sharing_id).await.unwrap();
		s.members[1].status == MemberStatus::Revoked && !s.active
	})
	.await;
	assert!(world
		.jobs
		.scheduler
		.get_all_triggers(&alice, None)
		.await
		.is_empty());

	write_file(&alice, &dir.doc_id, "after.txt", b"after", None).await;
	tokio::time::sleep(Duration::from_millis(500)).await;
	assert!(recipient_file_by_path(&bob, "/Shared with me/Docs/after.txt")
		.await
		.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn quota_is_enforced_before_writing() {
	let world = world();
	let alice = open(&world, "alice.example.net", 100).await;
	let fs = alice.vfs();

	// Declared size beyond the quota is refused upfront.
	let doc = FileDoc::new("big.bin", vfs::ROOT_DIR_ID, 200, String::new(), String::new(), String::new(), false)
		.unwrap();
	let err = fs.create_file(doc, None).await.err().expect("refused");
	assert!(matches!(err, vfs::VfsError::FileTooBig));

	// Undeclared size is caught while streaming, before any commit.
	let doc = FileDoc::new("sneaky.bin", vfs::ROOT_DIR_ID, 0, String::new(), String::new(), String::new(), false)
		.unwrap();
	let mut handle = fs.create_file(doc, None).await.unwrap();
	let err = handle.write(&[0u8; 200]).await.err().expect("refused");
	assert!(matches!(err, vfs::VfsError::FileTooBig));
	handle.abort().await.unwrap();
	assert_eq!(fs.disk_usage().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn debounced_event_trigger_appends_payloads() {
	let seen: Arc<std::sync::Mutex<Vec<Value>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
	let log = seen.clone();
	let func: WorkerFunc = Arc::new(move |ctx| {
		let log = log.clone();
		Box::pin(async move {
			log.lock().unwrap().push(ctx.event.unwrap_or(Value::Null));
			Ok(())
		})
	});
	let world = world_with_extra_workers(vec![(WorkerConfig::new("test-echo"), func)]);
	let alice = open(&world, "alice.example.net", 0).await;

	let mut infos = TriggerInfos::new(
		&alice.domain,
		"@event",
		"test-echo",
		"io.cozy.pings:CREATED",
		Value::Null,
	);
	infos.debounce = "300ms".to_owned();
	infos.combine = "append".to_owned();
	world
		.jobs
		.scheduler
		.add_trigger(&alice, infos)
		.await
		.expect("trigger added");

	for n in 1..=3 {
		alice
			.realtime
			.publish(Verb::Created, "io.cozy.pings", "p", json!({ "n": n }), None);
		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	eventually("the debounced job fires once", || async {
		!seen.lock().unwrap().is_empty()
	})
	.await;
	tokio::time::sleep(Duration::from_millis(500)).await;

	let events = seen.lock().unwrap().clone();
	assert_eq!(events.len(), 1, "exactly one job fired");
	let payloads = events[0].as_array().expect("append mode sends a list");
	assert_eq!(payloads.len(), 3);
	let order: Vec<i64> = payloads
		.iter()
		.map(|p| p["doc"]["n"].as_i64().unwrap())
		.collect();
	assert_eq!(order, vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn replaying_a_bulk_docs_batch_is_idempotent() {
	let world = world();
	let alice = open(&world, "alice.example.net", 0).await;
	let bob = open(&world, "bob.example.net", 0).await;
	let (sharing_id, dir) = share_docs_dir(&world, &alice, &bob, false).await;

	// A subdirectory replicates to bob as a plain document.
	let sub = mkdir(&alice, &dir.doc_id, "reports").await;
	eventually("the subdirectory lands on bob", || async {
		bob.vfs().dir_by_path("/Shared with me/Docs/reports").await.is_ok()
	})
	.await;

	// Craft the same batch the replicator would send, and replay it.
	let s = find_sharing(&alice, &sharing_id).await.unwrap();
	let creds = s.credentials_for(1).unwrap();
	let (doc, chain) = alice.store.get_with_revs(FILES, &sub.doc_id).await.unwrap();
	let mut out = doc;
	replicator::transform_doc_to_sent(FILES, &mut out, &creds.xor_key);
	out["_revisions"] =
		serde_json::to_value(revision::RevsStruct::from_chain(&chain)).unwrap();
	let mut batch = sharing::DocsByDoctype::new();
	batch.insert(FILES.to_owned(), vec![out]);

	let before = bob
		.vfs()
		.dir_by_path("/Shared with me/Docs/reports")
		.await
		.unwrap();
	replicator::apply_bulk_docs(&bob, &sharing_id, &batch)
		.await
		.expect("first replay is accepted");
	replicator::apply_bulk_docs(&bob, &sharing_id, &batch)
		.await
		.expect("second replay is accepted");
	let after = bob
		.vfs()
		.dir_by_path("/Shared with me/Docs/reports")
		.await
		.unwrap();
	assert_eq!(before.doc_rev, after.doc_rev);
	assert_eq!(before.fullpath, after.fullpath);
}

#[tokio::test(flavor = "multi_thread")]
async fn incoming_push_for_an_older_generation_is_diverted() {
	let world = world();
	let alice = open(&world, "alice.example.net", 0).await;
	let bob = open(&world, "bob.example.net", 0).await;
	let (sharing_id, dir) = share_docs_dir(&world, &alice, &bob, false).await;

	let base = write_file(&alice, &dir.doc_id, "hi.txt", b"v1", None).await;
	let created = write_file(&alice, &dir.doc_id, "hi.txt", b"current", Some(base)).await;
	let current = alice.vfs().file_by_id(&created.doc_id).await.unwrap();
	assert_eq!(revision::generation(&current.doc_rev), 2);

	// A forged push claiming an older generation must lose and land in a
	// conflict copy, leaving the original file untouched.
	use md5::{Digest, Md5};
	let mut forged = current.clone();
	forged.doc_rev = "1-zzzzzzzz".to_owned();
	forged.md5sum = hex::encode(Md5::digest(b"forged"));
	forged.byte_size = b"forged".len() as u64;
	let target = FileDocWithRevisions {
		file: forged,
		revisions: revision::RevsStruct {
			start: 1,
			ids: vec!["zzzzzzzz".to_owned()],
		},
	};
	let key = sharing::upload::handle_sync_file(&alice, &sharing_id, &target)
		.await
		.expect("phase 1 accepted")
		.expect("the content is requested");
	sharing::upload::handle_file_upload(&alice, &sharing_id, &key.key, b"forged".to_vec())
		.await
		.expect("phase 2 accepted");

	let untouched = alice.vfs().file_by_path("/Docs/hi.txt").await.unwrap();
	assert_eq!(read_file(&alice, &untouched).await, b"current");
	let dir_children = alice
		.vfs()
		.dir_children(&alice.vfs().dir_by_path("/Docs").await.unwrap())
		.await
		.unwrap();
	let copy = dir_children
		.iter()
		.find_map(|c| match c {
			vfs::DirOrFile::File(f) if f.name.starts_with("hi (conflict ") => Some(f.clone()),
			_ => None,
		})
		.expect("the loser landed in a conflict copy");
	assert_eq!(read_file(&alice, &copy).await, b"forged");
}

#[tokio::test(flavor = "multi_thread")]
async fn trash_and_restore_preserve_paths() {
	let world = world();
	let alice = open(&world, "alice.example.net", 0).await;
	let fs = alice.vfs();

	let dir = mkdir(&alice, vfs::ROOT_DIR_ID, "Projects").await;
	let file = write_file(&alice, &dir.doc_id, "plan.txt", b"v1", None).await;

	let trashed = trash::trash_file(fs.as_ref(), &file).await.unwrap();
	assert!(trashed.trashed);
	assert_eq!(trashed.restore_path, "/Projects");
	assert!(fs.file_by_path("/Projects/plan.txt").await.is_err());

	let restored = trash::restore_file(fs.as_ref(), &trashed).await.unwrap();
	assert!(!restored.trashed);
	assert_eq!(
		fs.file_path(&restored).await.unwrap(),
		"/Projects/plan.txt"
	);
}
