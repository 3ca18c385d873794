use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use formsync::cache::{self, CacheMessage, CacheReply, HttpUpstream, InterceptLayer, ResourceCache};
use formsync::db::Store;
use formsync::error::Error;
use formsync::openrosa::ProtocolClient;
use formsync::records::{Attachment, Record, RecordQueue, SaveMode, SubmissionKeyDetector};
use formsync::survey::{
  FormCache, FormEvent, OpenRosaSource, Survey, SurveySource, TransformSource,
};
use formsync::sync::{SyncUploader, UploadReport};

use crate::config::{Config, SourceKind};
use crate::event::{Event, EventHandler};

const STATUS_TICK: Duration = Duration::from_secs(60);

/// Every component, wired from one configuration
pub struct App {
  config: Config,
  client: ProtocolClient,
  forms: FormCache<Store>,
  queue: Arc<RecordQueue<Store>>,
  uploader: SyncUploader<Store>,
  resources: ResourceCache<Store, HttpUpstream>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let store = Arc::new(match &config.database.path {
      Some(path) => Store::open(path)?,
      None => Store::open_default()?,
    });

    let client = ProtocolClient::new(config.client_settings())?;
    let routes = config.routes()?;

    let source: Arc<dyn SurveySource> = match config.cache.source {
      SourceKind::OpenRosa => Arc::new(OpenRosaSource::new(client.clone())),
      SourceKind::Transform => Arc::new(TransformSource::new(
        routes.clone(),
        config.request_timeout(),
        client.user_agent(),
      )?),
    };
    let forms = FormCache::with_settings(
      store.clone(),
      source,
      routes.clone(),
      config.form_cache_settings(),
    );

    let queue = Arc::new(
      RecordQueue::new(store.clone()).with_encryption(Arc::new(SubmissionKeyDetector)),
    );

    let mut credentials = HashMap::new();
    for server in &config.servers {
      credentials.insert(server.url.clone(), config.credentials_for(&server.url)?);
    }
    let uploader = SyncUploader::new(queue.clone(), Arc::new(client.clone()))
      .with_credentials(credentials);

    let upstream = Arc::new(HttpUpstream::new(
      config.request_timeout(),
      client.user_agent(),
    )?);
    let resources = ResourceCache::new(store, upstream, routes, config.cache_version())
      .with_static_assets(config.cache.static_assets.clone());

    Ok(Self {
      config,
      client,
      forms,
      queue,
      uploader,
      resources,
    })
  }

  /// Make sure a survey is cached, checking credentials first
  pub async fn fetch(&self, survey_id: &str) -> Result<Survey> {
    let descriptor = self.config.descriptor(survey_id)?;
    self
      .client
      .authenticate(&descriptor.server_url, &descriptor.credentials)
      .await?;
    Ok(self.forms.ensure(&descriptor).await?)
  }

  pub fn list_records(&self, survey_id: &str, drafts: bool) -> Result<Vec<Record>> {
    if drafts {
      Ok(self.queue.get_draft_list(survey_id)?)
    } else {
      Ok(self.queue.get_displayable_record_list(survey_id, false)?)
    }
  }

  /// Save a record from an XML file, with optional attachments
  pub fn add_record(
    &self,
    survey_id: &str,
    record_id: &str,
    name: Option<&str>,
    xml_path: &Path,
    attachments: &[std::path::PathBuf],
    draft: bool,
  ) -> Result<Record> {
    let survey = self
      .forms
      .load(survey_id)?
      .ok_or_else(|| eyre!("Survey {} is not cached; run `formsync fetch {}` first", survey_id, survey_id))?;

    let xml = std::fs::read_to_string(xml_path)
      .map_err(|e| eyre!("Failed to read {}: {}", xml_path.display(), e))?;
    let mut record = Record::new(record_id, survey_id, name.unwrap_or(record_id), xml).draft(draft);
    for path in attachments {
      let data = std::fs::read(path).map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
      let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| eyre!("Invalid attachment path {}", path.display()))?;
      record = record.with_file(Attachment::new(file_name, data));
    }

    let mode = if self.queue.get(record_id)?.is_some() {
      SaveMode::Update
    } else {
      SaveMode::Create
    };
    match self.queue.save(mode, &survey, record) {
      Err(Error::EncryptionUnavailable(id)) => Err(eyre!(
        "Survey {} encrypts submissions, which formsync cannot do; save the record with --draft",
        id
      )),
      saved => Ok(saved?),
    }
  }

  pub async fn upload(&self) -> Result<UploadReport> {
    Ok(self.uploader.upload_queue().await?)
  }

  /// Ask the resource cache whether a survey changed, through its channel
  pub async fn check_hash(&self, survey_id: &str) -> Result<CacheReply> {
    let page = self.resources.routes().shell_url(survey_id)?;
    let (handle, _task) = cache::spawn(self.resources.clone());
    let reply = handle
      .post(CacheMessage::CheckFormHash {
        survey_id: survey_id.to_string(),
        url: page.to_string(),
      })
      .await?;
    Ok(reply)
  }

  /// Keep every configured survey fresh and drain the queue until Ctrl-C
  pub async fn watch(&self) -> Result<()> {
    let activated = self.resources.on_activate().await?;
    if !self.config.cache.static_assets.is_empty() {
      match self.resources.on_install().await {
        Ok(report) => tracing::info!(cached = report.cached, "Static assets installed"),
        Err(e) => tracing::warn!(error = %e, "Static asset install failed"),
      }
    }
    tracing::debug!(deleted = ?activated.deleted_partitions, "Resource cache activated");

    let mut events = EventHandler::new(self.forms.subscribe(), STATUS_TICK);

    let mut freshness = Vec::new();
    for survey in &self.config.surveys {
      match self.fetch(&survey.id).await {
        Ok(_) => freshness.push(self.forms.schedule_freshness_checks(&survey.id)),
        Err(e) => tracing::warn!(survey_id = %survey.id, error = %e, "Could not cache survey"),
      }
    }

    let uploads = self.uploader.schedule(
      Duration::from_secs(self.config.sync.upload_initial_secs),
      Duration::from_secs(self.config.sync.upload_interval_secs),
    );
    tracing::info!(surveys = freshness.len(), "Watching");

    while let Some(event) = events.next().await {
      match event {
        Event::Form(FormEvent::Updated { survey_id, hash }) => {
          tracing::info!(survey_id = %survey_id, hash = %hash, "Survey updated");
        }
        Event::Form(FormEvent::Removed { survey_id }) => {
          tracing::warn!(survey_id = %survey_id, "Survey removed from server");
        }
        Event::Tick => {
          let queued = self.queue.queue()?.len();
          tracing::info!(queued, "Queue status");
        }
        Event::Shutdown => break,
      }
    }

    uploads.stop();
    for handle in freshness {
      handle.stop();
    }
    tracing::info!("Stopped watching");
    Ok(())
  }

  /// Resolve a resource through the intercepting cache
  pub async fn resolve(&self, url: &str) -> Result<formsync::cache::Intercepted> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
    Ok(
      self
        .resources
        .on_intercept(formsync::cache::InterceptRequest::get(url))
        .await?,
    )
  }
}
