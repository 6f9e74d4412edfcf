/// One rEFInd menu entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    pub title: String,
    pub loader: String,
}

/// Seconds rEFInd waits before booting the default entry.
const MENU_TIMEOUT: u32 = 40;

/// Render `refind.conf` with a text-only menu holding exactly `entries`, in
/// order.
pub fn refind_config(entries: &[MenuEntry]) -> String {
    let mut config = format!(
        "# rEFInd boot menu\n\
         # generated by vcfkit\n\
         \n\
         timeout {MENU_TIMEOUT}\n\
         textonly\n\
         scanfor manual\n\
         showtools shell, reboot\n"
    );
    for entry in entries {
        config.push_str(&format!(
            "\nmenuentry \"{}\" {{\n    loader {}\n}}\n",
            entry.title, entry.loader
        ));
    }
    config
}
