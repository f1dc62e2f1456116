// Copyright 2024 the tjs authors. MIT license.

//! `tjs`: runs a JavaScript/TypeScript entry module through the core
//! runtime substrate in `tjs_runtime`.

mod ops;

use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser as ClapParser;
use deno_core::JsRuntime;
use deno_core::ModuleSpecifier;
use deno_core::RuntimeOptions;
use tjs_runtime::http::client::HttpClient;
use tjs_runtime::module_loader::HttpRemoteFetcher;
use tjs_runtime::module_loader::Resolver;
use tjs_runtime::module_loader::TjsModuleLoader;
use tjs_runtime::pool::ConnectionPool;
use tjs_runtime::RuntimeConfig;

#[derive(ClapParser, Debug)]
#[command(name = "tjs", version, about = "Run a JavaScript or TypeScript module")]
struct Cli {
  /// Entry module: a file path or an http(s)/jsr specifier.
  entry: String,

  /// Arguments passed through to the running script.
  #[arg(trailing_var_arg = true)]
  script_args: Vec<String>,

  /// Override the module cache directory (default: `~/.tjs/cache`).
  #[arg(long)]
  cache_dir: Option<PathBuf>,

  /// Disable TLS certificate verification for remote module fetches.
  #[arg(long)]
  unsafely_ignore_certificate_errors: bool,

  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,
}

fn main() {
  let cli = Cli::parse();

  let log_level = match cli.verbose {
    0 => log::LevelFilter::Warn,
    1 => log::LevelFilter::Info,
    _ => log::LevelFilter::Debug,
  };
  tjs_runtime::init_logging(log_level);

  let mut config = RuntimeConfig::default();
  if let Some(dir) = cli.cache_dir {
    config.cache_dir = dir;
  }
  config.unsafely_ignore_certificate_errors = cli.unsafely_ignore_certificate_errors;

  let entry_specifier = match resolve_entry_specifier(&cli.entry) {
    Ok(specifier) => specifier,
    Err(err) => {
      eprintln!("tjs: {err}");
      std::process::exit(1);
    }
  };

  let local = tokio::task::LocalSet::new();
  let runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()
    .expect("failed to start the tokio runtime");

  let exit_code = local.block_on(&runtime, run(config, entry_specifier, cli.script_args));
  std::process::exit(exit_code);
}

fn resolve_entry_specifier(entry: &str) -> Result<ModuleSpecifier, String> {
  if entry.contains("://") {
    return ModuleSpecifier::parse(entry).map_err(|e| format!("'{entry}' is not a valid URL: {e}"));
  }
  let path = std::fs::canonicalize(entry).map_err(|e| format!("cannot open '{entry}': {e}"))?;
  ModuleSpecifier::from_file_path(&path).map_err(|_| format!("'{entry}' is not a valid module path"))
}

async fn run(config: RuntimeConfig, entry_specifier: ModuleSpecifier, script_args: Vec<String>) -> i32 {
  let pool = ConnectionPool::new(
    config.max_sockets_per_pool,
    config.pool_acquire_timeout_ms,
    config.keep_alive_idle_timeout_ms,
  );
  let client = HttpClient::new(pool, config.unsafely_ignore_certificate_errors);
  let fetcher = HttpRemoteFetcher { client };
  let resolver = Rc::new(Resolver::new(config.cache_dir.clone(), fetcher));
  let loader = Rc::new(TjsModuleLoader::new(resolver));

  let mut runtime = JsRuntime::new(RuntimeOptions {
    module_loader: Some(loader),
    extensions: vec![ops::tjs_runtime_ext::init(script_args)],
    ..Default::default()
  });

  let result = async {
    let mod_id = runtime.load_main_es_module(&entry_specifier).await?;
    let evaluate = runtime.mod_evaluate(mod_id);
    runtime.run_event_loop(Default::default()).await?;
    evaluate.await
  }
  .await;

  match result {
    Ok(()) => 0,
    Err(err) => {
      eprintln!("tjs: uncaught error: {err}");
      1
    }
  }
}
