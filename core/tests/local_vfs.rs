//! The local-filesystem back-end: the directory tree mirrors the
//! documents by full path, and the create-file protocol goes through a
//! temporary file.

use std::{sync::Arc, time::Duration};

use anyhow::Result;

use cozy_core::{
	couch::MemStore,
	job::JobSystem,
	vfs::{self, trash, DirDoc, FileDoc, FileHandle, Indexer, Vfs},
	Config, Env, Instance, InstanceOpts, InstanceSettings,
};

async fn open_local(root: &std::path::Path) -> Result<Arc<Instance>> {
	let mut config = Config::default();
	config.fs_root = root.to_owned();
	config.poll_interval = Duration::from_secs(60);
	let env = Env::new(config);
	let jobs = JobSystem::start(Vec::new(), Duration::from_secs(60));
	let instance = Instance::open(
		InstanceOpts {
			domain: "carol.example.net".to_owned(),
			url: String::new(),
			quota: 0,
			store: Arc::new(MemStore::new()),
			objects: None,
			settings: InstanceSettings::default(),
		},
		env,
		jobs,
	)
	.await?;
	Ok(instance)
}

#[tokio::test]
async fn files_land_on_disk_by_path() -> Result<()> {
	let tmp = tempfile::tempdir()?;
	let instance = open_local(tmp.path()).await?;
	let fs = instance.vfs();

	let root = fs.dir_by_id(vfs::ROOT_DIR_ID).await?;
	let mut dir = DirDoc::new_with_parent("Notes", &root)?;
	fs.create_dir(&mut dir).await?;

	let doc = FileDoc::new("today.txt", &dir.doc_id, 0, String::new(), String::new(), String::new(), false)?;
	let mut handle = fs.create_file(doc, None).await?;
	handle.write(b"dear diary").await?;
	let file = handle.close().await?;
	assert_eq!(file.byte_size, 10);

	let on_disk = tmp
		.path()
		.join("carol-example-net")
		.join("Notes")
		.join("today.txt");
	assert_eq!(std::fs::read(&on_disk)?, b"dear diary");

	// The path invariant: path(f) = path(parent(f)) / name(f).
	assert_eq!(fs.file_path(&file).await?, "/Notes/today.txt");
	Ok(())
}

#[tokio::test]
async fn declared_hash_and_size_are_verified() -> Result<()> {
	let tmp = tempfile::tempdir()?;
	let instance = open_local(tmp.path()).await?;
	let fs = instance.vfs();

	let doc = FileDoc::new(
		"bad.bin",
		vfs::ROOT_DIR_ID,
		0,
		"00000000000000000000000000000000".to_owned(),
		String::new(),
		String::new(),
		false,
	)?;
	let mut handle = fs.create_file(doc, None).await?;
	handle.write(b"whatever").await?;
	let err = handle.close().await.err().expect("hash mismatch rejected");
	assert!(matches!(err, vfs::VfsError::InvalidHash));

	let doc = FileDoc::new("short.bin", vfs::ROOT_DIR_ID, 100, String::new(), String::new(), String::new(), false)?;
	let mut handle = fs.create_file(doc, None).await?;
	handle.write(b"only this").await?;
	let err = handle.close().await.err().expect("length mismatch rejected");
	assert!(matches!(err, vfs::VfsError::ContentLengthMismatch { .. }));

	// Nothing but the bookkeeping directories was left behind.
	assert!(fs.file_by_path("/bad.bin").await.is_err());
	assert!(fs.file_by_path("/short.bin").await.is_err());
	Ok(())
}

#[tokio::test]
async fn trash_moves_the_content_and_restore_brings_it_back() -> Result<()> {
	let tmp = tempfile::tempdir()?;
	let instance = open_local(tmp.path()).await?;
	let fs = instance.vfs();

	let root = fs.dir_by_id(vfs::ROOT_DIR_ID).await?;
	let mut dir = DirDoc::new_with_parent("Archive", &root)?;
	fs.create_dir(&mut dir).await?;
	let doc = FileDoc::new("old.txt", &dir.doc_id, 0, String::new(), String::new(), String::new(), false)?;
	let mut handle = fs.create_file(doc, None).await?;
	handle.write(b"bytes").await?;
	let file = handle.close().await?;

	let trashed = trash::trash_file(fs.as_ref(), &file).await?;
	let mount = tmp.path().join("carol-example-net");
	assert!(!mount.join("Archive").join("old.txt").exists());
	assert!(mount.join("Trash").join("old.txt").exists());

	let restored = trash::restore_file(fs.as_ref(), &trashed).await?;
	assert!(mount.join("Archive").join("old.txt").exists());
	assert_eq!(fs.file_path(&restored).await?, "/Archive/old.txt");

	// A version is captured when content changes.
	let update = FileDoc::new("old.txt", &dir.doc_id, 0, String::new(), String::new(), String::new(), false)?;
	let mut handle = fs.create_file(update, Some(restored.clone())).await?;
	handle.write(b"new bytes").await?;
	let updated = handle.close().await?;
	assert_ne!(updated.md5sum, restored.md5sum);
	let versions = fs.indexer().versions_of(&updated.doc_id).await?;
	assert_eq!(versions.len(), 1);
	assert_eq!(versions[0].byte_size, 5);
	Ok(())
}
