//! One tenant: a domain, a document store prefix, a VFS and a realtime
//! hub, plus the handles every operation needs.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::info;

use crate::{
	couch::{self, CouchError, Doc, Store},
	env::Env,
	error::Error,
	job::JobSystem,
	realtime::{Hub, Verb},
	vfs::{
		indexer::CouchIndexer, local::LocalVfs, object::ObjectVfs, store::ObjectStore,
		DiskThreshold, Vfs,
	},
};

#[derive(Debug, Clone, Default)]
pub struct InstanceSettings {
	pub public_name: String,
	pub email: String,
}

pub struct InstanceOpts {
	pub domain: String,
	/// Base URL of the instance; defaults to `https://<domain>`.
	pub url: String,
	/// Disk quota in bytes; zero falls back to the configured default.
	pub quota: u64,
	pub store: Arc<dyn Store>,
	/// Content store for the object-storage back-end; `None` mounts a
	/// local-filesystem VFS under the configured root.
	pub objects: Option<Arc<dyn ObjectStore>>,
	pub settings: InstanceSettings,
}

pub struct Instance {
	pub domain: String,
	pub prefix: String,
	pub url: String,
	pub env: Arc<Env>,
	pub store: Arc<dyn Store>,
	pub realtime: Hub,
	pub jobs: Arc<JobSystem>,
	pub settings: InstanceSettings,
	vfs: OnceCell<Arc<dyn Vfs>>,
}

impl Instance {
	pub async fn open(
		opts: InstanceOpts,
		env: Arc<Env>,
		jobs: Arc<JobSystem>,
	) -> Result<Arc<Self>, Error> {
		let prefix = opts.domain.replace(['.', ':'], "-");
		let url = if opts.url.is_empty() {
			format!("https://{}", opts.domain)
		} else {
			opts.url
		};
		let realtime = Hub::new(&opts.domain);
		let threshold = DiskThreshold {
			quota: if opts.quota > 0 {
				opts.quota
			} else {
				env.config.disk_quota
			},
			max_file_size: env.config.max_file_size,
		};
		let indexer = CouchIndexer::new(opts.store.clone(), realtime.clone());
		let vfs: Arc<dyn Vfs> = match opts.objects {
			Some(objects) => ObjectVfs::new(
				&opts.domain,
				&prefix,
				indexer,
				objects,
				env.clone(),
				threshold,
			),
			None => LocalVfs::new(
				&opts.domain,
				env.config.fs_root.join(&prefix),
				indexer,
				env.clone(),
				threshold,
			),
		};
		vfs.init().await?;

		info!(target: "instance", domain = %opts.domain, "instance opened");
		let instance = Arc::new(Self {
			domain: opts.domain,
			prefix,
			url,
			env,
			store: opts.store,
			realtime,
			jobs,
			settings: opts.settings,
			vfs: OnceCell::new(),
		});
		let _ = instance.vfs.set(vfs);
		Ok(instance)
	}

	pub fn vfs(&self) -> Arc<dyn Vfs> {
		self.vfs
			.get()
			.expect("the instance vfs is built at open")
			.clone()
	}

	pub fn page_url(&self, path: &str) -> String {
		format!("{}{}", self.url, path)
	}

	/// Persists a new document and publishes the realtime event.
	pub async fn create_doc<T: Doc>(&self, doc: &mut T) -> Result<(), CouchError> {
		let value = couch::to_value(doc)?;
		let (id, rev) = self.store.put(T::DOCTYPE, value.clone()).await?;
		doc.set_id(id.clone());
		doc.set_rev(rev.clone());
		let mut published = value;
		published["_id"] = Value::String(id.clone());
		published["_rev"] = Value::String(rev);
		self.realtime
			.publish(Verb::Created, T::DOCTYPE, &id, published, None);
		Ok(())
	}

	/// Persists an update of a document and publishes the realtime event.
	pub async fn update_doc<T: Doc>(&self, doc: &mut T) -> Result<(), CouchError> {
		let old = self.store.get(T::DOCTYPE, doc.id()).await.ok();
		let value = couch::to_value(doc)?;
		let (id, rev) = self.store.put(T::DOCTYPE, value.clone()).await?;
		doc.set_rev(rev.clone());
		let mut published = value;
		published["_id"] = Value::String(id.clone());
		published["_rev"] = Value::String(rev);
		self.realtime
			.publish(Verb::Updated, T::DOCTYPE, &id, published, old);
		Ok(())
	}

	pub async fn get_doc<T: Doc>(&self, id: &str) -> Result<T, CouchError> {
		couch::from_value(self.store.get(T::DOCTYPE, id).await?)
	}

	/// Deletes a document and publishes the realtime event.
	pub async fn delete_doc<T: Doc>(&self, doc: &T) -> Result<(), CouchError> {
		let rev = self.store.delete(T::DOCTYPE, doc.id(), doc.rev()).await?;
		let old = couch::to_value(doc)?;
		self.realtime.publish(
			Verb::Deleted,
			T::DOCTYPE,
			doc.id(),
			couch::tombstone(doc.id(), &rev),
			Some(old),
		);
		Ok(())
	}
}
