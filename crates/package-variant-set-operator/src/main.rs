use clap::Parser;
use package_variant_set_operator::{
    cli::{Command, Opts},
    client, controller,
    crd::{CustomResourceExt, PackageVariantSet},
    logging,
};
use snafu::{ResultExt, Snafu};

const LOG_ENV_VAR: &str = "PACKAGE_VARIANT_SET_OPERATOR_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to print the CustomResourceDefinition"))]
    PrintCrd {
        source: package_variant_set_operator::crd::Error,
    },

    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to create the Kubernetes client"))]
    CreateClient { source: client::Error },
}

#[tokio::main]
#[snafu::report]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();
    match opts.command {
        Command::Crd => PackageVariantSet::print_yaml_schema().context(PrintCrdSnafu)?,
        Command::Run(args) => {
            logging::initialize_logging(LOG_ENV_VAR, controller::OPERATOR_NAME, &args.logging)
                .context(InitializeLoggingSnafu)?;
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                "Starting {}",
                controller::OPERATOR_NAME
            );

            let client = client::create_client(Some(controller::OPERATOR_NAME.to_owned()))
                .await
                .context(CreateClientSnafu)?;
            controller::run(
                client,
                &args.watch_namespace,
                args.reconcile_options(),
                args.requeue_after_error,
                args.resync_interval,
            )
            .await;
        }
    }

    Ok(())
}
