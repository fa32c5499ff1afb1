pub mod image;
pub mod k8s_object;

use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Container image operations
    #[command(subcommand)]
    Image(image::ImageCommand),

    /// Kubernetes object operations
    #[command(name = "k8s-object", subcommand)]
    K8sObject(k8s_object::K8sObjectCommand),
}
