use spark_netstack_telemetry::{Error, install, install_with_directives, is_installed};

#[test]
fn second_install_is_rejected() {
    assert!(!is_installed());
    install_with_directives("spark_netstack=debug").expect("首次安装应成功");
    assert!(is_installed());
    assert!(matches!(install(), Err(Error::AlreadyInstalled)));
    tracing::info!("telemetry installed");
}
