fn main() {
    std::process::exit(device_owner_provisioner_lib::run());
}
