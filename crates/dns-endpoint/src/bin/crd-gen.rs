use dns_endpoint::DNSEndpoint;
use kube::CustomResourceExt;

fn main() {
    let crd = DNSEndpoint::crd();
    let yaml = serde_yaml::to_string(&crd).expect("serialize CRD");
    println!("{}", yaml);
}
