// ABOUTME: Built-in per-keyword defaults consulted when no config source has a value.
// ABOUTME: Mirrors the OpenSSH client defaults for the keywords sshc reads.

/// Default value for `keyword`, or the empty string when OpenSSH has none.
pub fn default_value(keyword: &str) -> &'static str {
    match keyword.to_ascii_lowercase().as_str() {
        "port" => "22",
        "identityfile" => "~/.ssh/identity",
        "addressfamily" => "any",
        "batchmode" => "no",
        "checkhostip" => "yes",
        "compression" => "no",
        "connectionattempts" => "1",
        "forwardagent" => "no",
        "hashknownhosts" => "no",
        "identitiesonly" => "no",
        "passwordauthentication" => "yes",
        "pubkeyauthentication" => "yes",
        "stricthostkeychecking" => "ask",
        "tcpkeepalive" => "yes",
        "userknownhostsfile" => "~/.ssh/known_hosts ~/.ssh/known_hosts2",
        "globalknownhostsfile" => "/etc/ssh/ssh_known_hosts /etc/ssh/ssh_known_hosts2",
        _ => "",
    }
}
