//! Wireshark extcap discovery handshake.
//!
//! Everything printed here goes to stdout, which Wireshark parses; keep
//! diagnostics on the log side.

use log::warn;

use crate::Options;
use crate::pcapng::LINKTYPE_USB_2_0;

pub const INTERFACE_NAME: &str = "usb_sniffer";
const HELP_URL: &str = "https://github.com/ataradov/usb-sniffer";

/// Answer any extcap query present in the options. Returns true if the
/// invocation was a query and the process should exit.
pub fn request(options: &Options) -> bool {
    if options.extcap_version.is_some() {
        println!("extcap {{version=1.0}}{{help={HELP_URL}}}\
                  {{display=USB Sniffer}}");
    }

    if options.extcap_interfaces {
        println!("interface {{value={INTERFACE_NAME}}}\
                  {{display=USB Sniffer}}");
        return true;
    }

    if let Some(interface) = &options.extcap_interface {
        if interface != INTERFACE_NAME {
            warn!("invalid interface '{interface}', \
                   expected {INTERFACE_NAME}");
            return true;
        }
    }

    if options.extcap_dlts {
        println!("dlt {{number={LINKTYPE_USB_2_0}}}{{name=USB}}\
                  {{display=USB}}");
        return true;
    }

    if options.extcap_config {
        print_config();
        return true;
    }

    false
}

fn print_config() {
    println!("arg {{number=0}}{{call=--speed}}{{display=Capture Speed}}\
              {{tooltip=USB capture speed}}{{type=selector}}");
    println!("value {{arg=0}}{{value=ls}}{{display=Low-Speed}}\
              {{default=false}}");
    println!("value {{arg=0}}{{value=fs}}{{display=Full-Speed}}\
              {{default=true}}");
    println!("value {{arg=0}}{{value=hs}}{{display=High-Speed}}\
              {{default=false}}");
    println!("arg {{number=1}}{{call=--fold}}{{display=Fold empty frames}}\
              {{tooltip=Fold frames that have no data or errors}}\
              {{type=boolflag}}");
    println!("arg {{number=2}}{{call=--trigger}}\
              {{display=Capture Trigger}}\
              {{tooltip=Condition used to start the capture}}\
              {{type=selector}}");
    println!("value {{arg=2}}{{value=disabled}}{{display=Disabled}}\
              {{default=true}}");
    println!("value {{arg=2}}{{value=low}}{{display=Low}}{{default=false}}");
    println!("value {{arg=2}}{{value=high}}{{display=High}}\
              {{default=false}}");
    println!("value {{arg=2}}{{value=falling}}{{display=Falling}}\
              {{default=false}}");
    println!("value {{arg=2}}{{value=rising}}{{display=Rising}}\
              {{default=false}}");
    println!("arg {{number=3}}{{call=--limit}}{{display=Capture Limit}}\
              {{tooltip=Limit the number of captured packets \
              (0 for unlimited)}}{{type=integer}}{{range=0,10000000}}\
              {{default=0}}");
}
