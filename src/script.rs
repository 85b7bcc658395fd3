//! Script compiler: turns script text (or a bare URL) into an ordered list
//! of typed `Command`s, applying the subset of commands that can be decided
//! at compile time directly onto the `Job`/`Task` configuration instead of
//! emitting them as runtime instructions.

use crate::config::{Command, Job, Verb};
use std::net::ToSocketAddrs;

pub struct ScriptCompiler;

impl ScriptCompiler {
    /// Compile a job's script (or synthesize one from its URL) into an
    /// ordered command list, applying pre-appliable commands onto `job` in
    /// place and returning the runtime commands plus the step count.
    pub fn compile(job: &mut Job) -> (Vec<Command>, usize) {
        let lines: Vec<String> = match &job.script {
            Some(text) if !text.trim().is_empty() => {
                text.lines().map(|l| l.to_string()).collect()
            }
            _ => {
                let url = job.url.clone().unwrap_or_default();
                return (
                    vec![Command {
                        verb: Verb::Navigate,
                        target: Some(url),
                        value: None,
                        record: true,
                    }],
                    1,
                );
            }
        };

        let mut commands: Vec<Command> = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(mut command) = Self::parse_line(&line) {
                Self::resolve_setdnsname(&mut command);
                Self::rewrite_element_command(&mut command);
                if command.verb.is_pre_applied() {
                    Self::apply_pre_command(job, &command);
                    continue;
                }
                commands.push(command);
            }
        }

        Self::trim_trailing_non_record(&mut commands);

        let step_count = commands.iter().filter(|c| c.record).count().max(1);
        (commands, step_count)
    }

    fn parse_line(line: &str) -> Option<Command> {
        let mut parts = line.split('\t');
        let raw_verb = parts.next()?.trim();
        let target = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let value = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let (verb_name, mut record) = match raw_verb.strip_suffix("andwait") {
            Some(base) => (base, true),
            None => (raw_verb, false),
        };

        let verb = verb_from_name(verb_name)?;
        if matches!(verb, Verb::Navigate | Verb::SubmitFormMarker) {
            record = true;
        }
        let verb = if matches!(verb, Verb::SubmitFormMarker) {
            Verb::Exec
        } else {
            verb
        };

        Some(Command {
            verb,
            target,
            value,
            record,
        })
    }

    /// `setdnsname` resolves its target hostname to a single IPv4 address at
    /// compile time; on success it becomes a plain `setdns`.
    fn resolve_setdnsname(command: &mut Command) {
        if command.verb != Verb::SetDnsName {
            return;
        }
        let Some(host) = &command.target else { return };
        let lookup = format!("{host}:0");
        if let Ok(mut addrs) = lookup.to_socket_addrs() {
            if let Some(addr) = addrs.find(|a| a.is_ipv4()) {
                command.verb = Verb::SetDns;
                command.value = Some(addr.ip().to_string());
            }
        }
    }

    /// Element-targeted commands become `exec` of a selector expression.
    fn rewrite_element_command(command: &mut Command) {
        let js = match command.verb {
            Verb::ClickMarker => Some(format!(
                "document.querySelector({:?}).click()",
                command.target.clone().unwrap_or_default()
            )),
            Verb::SetValueMarker => Some(format!(
                "document.querySelector({:?}).value = {:?}",
                command.target.clone().unwrap_or_default(),
                command.value.clone().unwrap_or_default()
            )),
            Verb::SetInnerTextMarker => Some(format!(
                "document.querySelector({:?}).innerText = {:?}",
                command.target.clone().unwrap_or_default(),
                command.value.clone().unwrap_or_default()
            )),
            Verb::SetInnerHtmlMarker => Some(format!(
                "document.querySelector({:?}).innerHTML = {:?}",
                command.target.clone().unwrap_or_default(),
                command.value.clone().unwrap_or_default()
            )),
            Verb::SelectValueMarker => Some(format!(
                "document.querySelector({:?}).value = {:?}",
                command.target.clone().unwrap_or_default(),
                command.value.clone().unwrap_or_default()
            )),
            Verb::SendClickMarker => Some(format!(
                "document.querySelector({:?}).dispatchEvent(new MouseEvent('click'))",
                command.target.clone().unwrap_or_default()
            )),
            _ => None,
        };
        if let Some(js) = js {
            command.verb = Verb::Exec;
            command.target = Some(js);
            command.value = None;
        }
    }

    fn apply_pre_command(job: &mut Job, command: &Command) {
        match command.verb {
            Verb::SetTimeout => {
                if let Some(v) = command.target.as_ref().and_then(|s| s.parse::<u32>().ok()) {
                    job.timeout_seconds = v;
                }
            }
            Verb::SetActivityTimeout => {
                if let Some(v) = command.target.as_ref().and_then(|s| s.parse::<u64>().ok()) {
                    job.activity_timeout_ms = v;
                }
            }
            Verb::SetViewportSize | Verb::SetBrowserSize => {
                if let (Some(w), Some(h)) = (
                    command.target.as_ref().and_then(|s| s.parse::<u32>().ok()),
                    command.value.as_ref().and_then(|s| s.parse::<u32>().ok()),
                ) {
                    job.viewport.width = w;
                    job.viewport.height = h;
                }
            }
            Verb::BlockDomains => {
                if let Some(targets) = &command.target {
                    job.block_list
                        .extend(targets.split(',').map(|d| d.trim().to_string()).filter(|d| !d.is_empty()));
                }
            }
            Verb::BlockDomainsExcept => {
                if let Some(targets) = &command.target {
                    job.block_list.extend(
                        targets
                            .split(',')
                            .map(|d| format!("!{}", d.trim()))
                            .filter(|d| d.len() > 1),
                    );
                }
            }
            Verb::SetDns => {
                if let (Some(host), Some(ip)) = (&command.target, &command.value) {
                    job.dns_override.push((host.clone(), ip.clone()));
                }
            }
            _ => {}
        }
    }

    /// Commands after the last `record` command carry no observable effect
    /// (there is no further capture to apply them to) and are dropped.
    fn trim_trailing_non_record(commands: &mut Vec<Command>) {
        while matches!(commands.last(), Some(c) if !c.record) {
            commands.pop();
        }
    }
}

fn verb_from_name(name: &str) -> Option<Verb> {
    Some(match name {
        "navigate" => Verb::Navigate,
        "setheader" => Verb::SetHeader,
        "addheader" => Verb::AddHeader,
        "setcookie" => Verb::SetCookie,
        "setuseragent" | "setua" => Verb::SetUserAgent,
        "setdns" => Verb::SetDns,
        "setdnsname" => Verb::SetDnsName,
        "blockdomains" => Verb::BlockDomains,
        "blockdomainsexcept" => Verb::BlockDomainsExcept,
        "block" => Verb::Block,
        "overridehost" => Verb::OverrideHost,
        "setviewportsize" => Verb::SetViewportSize,
        "setbrowsersize" => Verb::SetBrowserSize,
        "setdpr" => Verb::SetDpr,
        "settimeout" => Verb::SetTimeout,
        "setactivitytimeout" => Verb::SetActivityTimeout,
        "setminimumstepseconds" => Verb::SetMinimumStepSeconds,
        "setabm" => Verb::SetAbm,
        "logdata" => Verb::LogData,
        "combinesteps" => Verb::CombineSteps,
        "seteventname" => Verb::SetEventName,
        "waitfor" => Verb::WaitFor,
        "waitinterval" => Verb::WaitInterval,
        "exec" => Verb::Exec,
        "sleep" => Verb::Sleep,
        "click" => Verb::ClickMarker,
        "setvalue" => Verb::SetValueMarker,
        "submitform" => Verb::SubmitFormMarker,
        "setinnertext" => Verb::SetInnerTextMarker,
        "setinnerhtml" => Verb::SetInnerHtmlMarker,
        "selectvalue" => Verb::SelectValueMarker,
        "sendclick" => Verb::SendClickMarker,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Job;
    use std::collections::HashMap;

    fn empty_job() -> Job {
        Job {
            test_id: "t".into(),
            signature: "s".into(),
            work_server: "http://x/".into(),
            scheduler_job_id: None,
            runs: 1,
            first_view_only: true,
            warmup_runs: 0,
            viewport: Default::default(),
            timeout_seconds: 60,
            activity_timeout_ms: 2000,
            max_requests: None,
            stop_at_onload: false,
            video_enabled: false,
            tcpdump_enabled: false,
            keep_video: false,
            network: Default::default(),
            cpu_throttle: 1.0,
            url: None,
            script: None,
            headers: HashMap::new(),
            cookies: Vec::new(),
            host_overrides: HashMap::new(),
            custom_metrics: HashMap::new(),
            extensions: Vec::new(),
            output: Default::default(),
            pubsub_retry_queue: None,
            pubsub_completed_queue: None,
            warmup_countdown: 0,
            state: Default::default(),
            success: false,
            error: None,
            raw_payload: String::new(),
            running_lighthouse: false,
            lighthouse_throttle: false,
            profile_data_url: None,
            crux_api_key: None,
            block_list: Vec::new(),
            dns_override: Vec::new(),
        }
    }

    #[test]
    fn empty_script_synthesizes_navigate() {
        let mut job = empty_job();
        job.url = Some("http://example.com/".to_string());
        let (commands, steps) = ScriptCompiler::compile(&mut job);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].verb, Verb::Navigate);
        assert!(commands[0].record);
        assert_eq!(steps, 1);
    }

    #[test]
    fn andwait_promotes_to_record() {
        let mut job = empty_job();
        job.script = Some("navigateandwait\thttp://example.com/".to_string());
        let (commands, _) = ScriptCompiler::compile(&mut job);
        assert_eq!(commands.len(), 1);
        assert!(commands[0].record);
    }

    #[test]
    fn blockdomains_and_setdns_populate_job_fields() {
        let mut job = empty_job();
        job.script = Some(
            "blockdomains\tads.example.com,tracker.example.com\n\
             setdns\thost.example.com\t10.0.0.1\n\
             navigateandwait\thttp://example.com/"
                .to_string(),
        );
        let (commands, _) = ScriptCompiler::compile(&mut job);
        assert_eq!(commands.len(), 1);
        assert_eq!(
            job.block_list,
            vec!["ads.example.com".to_string(), "tracker.example.com".to_string()]
        );
        assert_eq!(
            job.dns_override,
            vec![("host.example.com".to_string(), "10.0.0.1".to_string())]
        );
    }

    #[test]
    fn settimeout_is_pre_applied_and_not_emitted() {
        let mut job = empty_job();
        job.script = Some("settimeout\t45\nnavigateandwait\thttp://example.com/".to_string());
        let (commands, _) = ScriptCompiler::compile(&mut job);
        assert_eq!(commands.len(), 1);
        assert_eq!(job.timeout_seconds, 45);
    }

    #[test]
    fn trailing_sleep_is_trimmed() {
        let mut job = empty_job();
        job.script = Some("navigateandwait\thttp://example.com/\nsleep\t5".to_string());
        let (commands, steps) = ScriptCompiler::compile(&mut job);
        assert_eq!(commands.len(), 1);
        assert_eq!(steps, 1);
    }

    #[test]
    fn click_rewritten_to_exec() {
        let mut job = empty_job();
        job.script = Some("clickandwait\t#submit".to_string());
        let (commands, _) = ScriptCompiler::compile(&mut job);
        assert_eq!(commands[0].verb, Verb::Exec);
        assert!(commands[0].target.as_ref().unwrap().contains("querySelector"));
    }
}
