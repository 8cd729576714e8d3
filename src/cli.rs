use clap::Parser;

/// Build and publish a kubevirtci release: provider images, cli, tarball, tag and GitHub release.
///
/// Required values are declared optional here and checked together by
/// [crate::config::runtime::Options::new], so that every missing flag is reported at once.
#[derive(Parser, Debug, Default)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to kubeconfig. If empty, the in-cluster service account is used.
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// The namespace in which Prow jobs should be created.
    #[arg(long)]
    pub jobs_namespace: Option<String>,

    /// Path to Prow config.yaml.
    #[arg(long)]
    pub config_path: Option<String>,

    /// Path to Prow job configs, either a file or a directory.
    #[arg(long)]
    pub job_config_path: Option<String>,

    /// Git base ref under test.
    #[arg(long)]
    pub base_ref: Option<String>,

    /// Git base SHA under test.
    #[arg(long)]
    pub base_sha: Option<String>,

    /// Providers to release, overriding the configured list.
    #[arg(long, value_delimiter = ',')]
    pub providers: Option<Vec<String>>,

    /// Root of the kubevirtci working tree.
    #[arg(long, default_value = ".")]
    pub kubevirtci_path: String,

    /// Directory to stage the release tarball in. A temporary directory is used if omitted.
    #[arg(long)]
    pub working_dir: Option<String>,

    /// Path to the releaser configuration file.
    #[arg(long)]
    pub config: Option<String>,

    #[arg(long)]
    pub github_server: Option<String>,

    #[arg(long)]
    pub github_api_url: Option<String>,

    /// Owner of the repository that is tagged and released.
    #[arg(long)]
    pub github_org: Option<String>,

    #[arg(long)]
    pub github_repo: Option<String>,

    /// Remote name or URL to push the tag to. Defaults to the URL derived from the git credentials.
    #[arg(long)]
    pub git_remote: Option<String>,

    /// Private key used to push tags over SSH.
    #[arg(long, env = "GITHUB_SSH_KEY")]
    pub github_ssh_key: Option<String>,

    /// File containing a GitHub token, used for HTTP pushes and as a release API fallback.
    #[arg(long, env = "GITHUB_TOKEN_PATH")]
    pub github_token_path: Option<String>,

    /// Token for the GitHub release API.
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// Seconds to wait for each release job to complete.
    #[arg(long)]
    pub job_timeout: Option<u64>,
}
