//! Runner: wires the parsed arguments to the transport, the resolver and the dumper

use crate::cli::args::Args;
use crate::config::DumpConfig;
use crate::error::{ErrorKind, RegistryError, Result};
use crate::logging::Logger;
use crate::registry::{CatalogOperations, RegistrySession, RepositoryDumper, Transport};
use std::sync::Arc;
use std::time::Instant;

pub struct Runner {
    args: Args,
    output: Logger,
}

impl Runner {
    pub fn new(args: Args) -> Self {
        let output = if args.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(args.verbose)
        };
        Self { args, output }
    }

    pub fn output(&self) -> &Logger {
        &self.output
    }

    pub async fn run(&self) -> Result<()> {
        let start_time = Instant::now();
        self.output.section("Registry Dumper");

        let config = self.args.to_config()?;
        self.output.info(&format!("Target registry: {}", config.endpoint.base_url()));
        self.output.verbose(&format!("Output directory: {}", config.output_dir.display()));

        let transport = Arc::new(Transport::connect(&config, self.output.clone()).await?);
        let result = self.run_with_transport(&config, Arc::clone(&transport)).await;
        transport.close().await;

        if let Err(error) = &result {
            if error.kind() == ErrorKind::Authorization {
                self.output
                    .warning("The registry requires credentials: retry with --username/--password, --bearer or --headers");
            }
            return result;
        }

        self.output.success(&format!(
            "Finished in {}",
            self.output.format_duration(start_time.elapsed())
        ));
        result
    }

    async fn run_with_transport(&self, config: &DumpConfig, transport: Arc<Transport>) -> Result<()> {
        let session = self.session(config, transport);
        let catalog = CatalogOperations::new(session.clone(), config.page_size);

        self.output.subsection("Checking registry API");
        let api = catalog.check_api_version().await?;
        self.output.success(&format!("Registry API version: {}", api.version));
        if api.auth_required && config.auth.is_anonymous() {
            self.output
                .warning("Registry answered 401 to the version probe and no credentials were given");
        }

        if !self.args.has_action() {
            self.print_actions();
            return Err(RegistryError::Config(
                "no action given: use --list, --dump <repository> or --dump-all".to_string(),
            ));
        }

        if config.auth.is_anonymous() {
            self.output.warning("No authentication configured, requests are anonymous");
        }
        if config.insecure {
            self.output.warning("TLS certificate verification is disabled");
        }

        if self.args.list {
            self.list(&catalog).await?;
        }

        if !self.args.dump_all && self.args.dump.is_none() {
            return Ok(());
        }

        tokio::fs::create_dir_all(&config.output_dir).await?;
        let dumper = RepositoryDumper::new(session, &config.output_dir, config.concurrency, config.page_size);

        if self.args.dump_all {
            self.output.subsection("Dumping all repositories");
            let summary = dumper.dump_all_repositories().await?;
            summary.log(&self.output);
        } else if let Some(repository) = &self.args.dump {
            let report = dumper.dump_repository(repository).await?;
            self.output.summary_kv(
                "Dump summary",
                &[
                    ("Repository", report.repository.clone()),
                    ("Tag", report.tag.clone()),
                    ("Manifest", report.manifest_path.display().to_string()),
                    ("Verified blobs", report.verified.len().to_string()),
                    ("Failed blobs", report.failed.len().to_string()),
                    ("Downloaded", self.output.format_size(report.bytes_downloaded())),
                ],
            );
        }
        Ok(())
    }

    fn session(&self, config: &DumpConfig, transport: Arc<Transport>) -> RegistrySession {
        let mut session = RegistrySession::new(
            transport,
            config.endpoint.clone(),
            config.auth.clone(),
            self.output.clone(),
        );
        if config.insecure {
            session = session.with_curl_flags("-k");
        }
        if let Some(proxy) = &config.proxy {
            session = session.with_curl_flags(&proxy.curl_flags());
        }
        session
    }

    async fn list(&self, catalog: &CatalogOperations) -> Result<()> {
        let repositories = catalog.list_repositories().await?;
        self.output.list(
            &format!("Repositories ({})", repositories.len()),
            &repositories,
        );
        Ok(())
    }

    fn print_actions(&self) {
        self.output.error("Nothing to do. Available actions:");
        for action in [
            "--list               list repositories in the catalog",
            "--dump <repository>  dump the first tag of one repository",
            "--dump-all           dump every repository in the catalog",
        ] {
            self.output.error(&format!("  {}", action));
        }
    }
}
