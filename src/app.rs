use crate::auth::credentials::CredentialStore;
use crate::auth::{connect_account, demo_accounts, flow_for, Account};
use crate::campaign::plan::MAX_RECIPIENTS_PER_MESSAGE;
use crate::campaign::progress::format_elapsed;
use crate::campaign::settings::{
    BATCH_DELAY_RANGE, BATCH_SIZE_RANGE, EMAIL_DELAY_RANGE, MAX_RETRIES_RANGE,
};
use crate::campaign::{
    CampaignConfig, ComposedEmail, EmailStatus, Orchestrator, RunState, RunStatus, SendMode,
    TokioClock,
};
use crate::config::AppConfig;
use crate::gmail::attachment::Attachment;
use crate::gmail::GmailClient;
use crate::recipients::{
    parse_recipients, read_recipient_file, write_recipient_list, ImportSummary, Recipient,
};
use crate::template::EmailTemplate;
use eframe::egui;
use egui::{Color32, Margin, RichText, Vec2, Visuals};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::watch;

// Results coming back from background work
enum Message {
    AccountConnected(Result<Account, String>),
    TemplateLoaded(Result<(String, String), String>),
    RunFinished(RunState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Account,
    Compose,
    Recipients,
    Settings,
    Review,
}

impl Step {
    const ALL: [Step; 5] = [
        Step::Account,
        Step::Compose,
        Step::Recipients,
        Step::Settings,
        Step::Review,
    ];

    fn title(self) -> &'static str {
        match self {
            Step::Account => "Select Account",
            Step::Compose => "Compose Email",
            Step::Recipients => "Import Recipients",
            Step::Settings => "Campaign Settings",
            Step::Review => "Review & Send",
        }
    }

    fn index(self) -> usize {
        Step::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }

    fn next(self) -> Self {
        Step::ALL.get(self.index() + 1).copied().unwrap_or(self)
    }

    fn previous(self) -> Self {
        self.index()
            .checked_sub(1)
            .and_then(|i| Step::ALL.get(i).copied())
            .unwrap_or(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFilter {
    All,
    Sent,
    Pending,
    Failed,
}

impl LogFilter {
    fn accepts(self, status: EmailStatus) -> bool {
        match self {
            LogFilter::All => true,
            LogFilter::Sent => status == EmailStatus::Sent,
            LogFilter::Pending => matches!(status, EmailStatus::Pending | EmailStatus::Sending),
            LogFilter::Failed => status == EmailStatus::Failed,
        }
    }
}

fn status_color(status: EmailStatus) -> Color32 {
    match status {
        EmailStatus::Pending => Color32::GRAY,
        EmailStatus::Sending => Color32::from_rgb(0x25, 0x63, 0xEB),
        EmailStatus::Sent => Color32::from_rgb(0x16, 0xA3, 0x4A),
        EmailStatus::Failed => Color32::DARK_RED,
    }
}

pub struct RapidMailApp {
    config: AppConfig,
    step: Step,

    // Account state
    accounts: Vec<Account>,
    selected_account: Option<Account>,
    connecting: bool,

    // Email content state
    subject: String,
    body: String,
    template_path_input: String,
    attachment_path_input: String,
    attachments: Vec<Attachment>,

    // Recipient state
    recipient_path_input: String,
    pasted_recipients: String,
    export_path_input: String,
    recipients: Vec<Recipient>,
    import_summary: Option<ImportSummary>,

    campaign: CampaignConfig,
    log_filter: LogFilter,
    status_message: String,

    // Sending
    credentials: Arc<CredentialStore>,
    gmail: Option<Arc<GmailClient>>,
    orchestrator: Option<Arc<Orchestrator>>,
    run_status: Option<watch::Receiver<RunStatus>>,

    // Background communication
    tokio_rt: Runtime,
    receiver: mpsc::Receiver<Message>,
    sender: mpsc::Sender<Message>,
}

impl RapidMailApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        config: AppConfig,
        credentials: Arc<CredentialStore>,
        tokio_rt: Runtime,
    ) -> Self {
        let mut style = (*cc.egui_ctx.style()).clone();
        style.visuals = Visuals::light();
        style.visuals.panel_fill = Color32::from_rgb(0xFC, 0xFC, 0xFC);
        style.visuals.window_fill = Color32::from_rgb(0xFC, 0xFC, 0xFC);
        style.visuals.window_corner_radius = 10.into();
        style.spacing.item_spacing = Vec2::new(8.0, 6.0);
        cc.egui_ctx.set_style(style);
        cc.egui_ctx.set_theme(egui::Theme::Light);

        let (sender, receiver) = mpsc::channel();

        let mut accounts = if config.accounts.demo {
            demo_accounts()
        } else {
            Vec::new()
        };
        match credentials.accounts() {
            Ok(stored) => accounts.extend(stored),
            Err(e) => warn!("Could not read connected accounts: {}", e),
        }
        let selected_account = credentials.selected_account().unwrap_or_else(|e| {
            warn!("Could not read the selected account: {}", e);
            None
        });

        let (gmail, orchestrator, status_message) =
            match GmailClient::new(&config.gmail, credentials.clone()) {
                Ok(client) => {
                    let client = Arc::new(client);
                    let orchestrator =
                        Arc::new(Orchestrator::new(client.clone(), Arc::new(TokioClock)));
                    (Some(client), Some(orchestrator), "Ready.".to_string())
                }
                Err(e) => {
                    error!("Failed to create the Gmail client: {}", e);
                    (None, None, format!("ERROR creating Gmail client: {}", e))
                }
            };
        let run_status = orchestrator.as_ref().map(|o| o.subscribe());

        if let Some(path) = config.sender.template_path.clone() {
            Self::spawn_template_load(sender.clone(), path);
        }

        RapidMailApp {
            campaign: config.campaign.clone(),
            config,
            step: Step::Account,
            accounts,
            selected_account,
            connecting: false,
            subject: String::new(),
            body: String::new(),
            template_path_input: String::new(),
            attachment_path_input: String::new(),
            attachments: Vec::new(),
            recipient_path_input: String::new(),
            pasted_recipients: String::new(),
            export_path_input: String::new(),
            recipients: Vec::new(),
            import_summary: None,
            log_filter: LogFilter::All,
            status_message,
            credentials,
            gmail,
            orchestrator,
            run_status,
            tokio_rt,
            receiver,
            sender,
        }
    }

    fn spawn_template_load(sender: mpsc::Sender<Message>, path: PathBuf) {
        thread::spawn(move || {
            let result = EmailTemplate::load(&path)
                .map(|template| (template.subject_template, template.body_template))
                .map_err(|e| format!("Failed to load template: {}", e));
            sender.send(Message::TemplateLoaded(result)).ok();
        });
    }

    fn run_state(&self) -> RunState {
        self.orchestrator
            .as_ref()
            .map(|o| o.status().state)
            .unwrap_or_default()
    }

    fn valid_recipient_count(&self) -> usize {
        self.recipients.iter().filter(|r| r.valid).count()
    }

    fn message_count(&self) -> usize {
        let valid = self.valid_recipient_count();
        match self.campaign.send_mode {
            SendMode::Standard => valid,
            SendMode::Bulk => valid.div_ceil(MAX_RECIPIENTS_PER_MESSAGE),
        }
    }

    fn step_complete(&self, step: Step) -> bool {
        match step {
            Step::Account => self.selected_account.is_some(),
            Step::Compose => !self.subject.trim().is_empty() && !self.body.trim().is_empty(),
            Step::Recipients => self.valid_recipient_count() > 0,
            Step::Settings | Step::Review => true,
        }
    }

    fn process_messages(&mut self) {
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                Message::AccountConnected(Ok(account)) => {
                    self.connecting = false;
                    self.status_message = format!("Connected {}", account.email);
                    self.accounts.retain(|a| a.id != account.id);
                    self.accounts.push(account.clone());
                    self.selected_account = Some(account);
                }
                Message::AccountConnected(Err(e)) => {
                    self.connecting = false;
                    self.status_message = format!("ERROR connecting account: {}", e);
                }
                Message::TemplateLoaded(Ok((subject, body))) => {
                    self.subject = subject;
                    self.body = body;
                    self.status_message = "Template loaded.".to_string();
                }
                Message::TemplateLoaded(Err(e)) => {
                    self.status_message = format!("ERROR loading template: {}", e);
                }
                Message::RunFinished(state) => {
                    info!("Send loop stopped in state {:?}", state);
                }
            }
        }

        let Some(rx) = self.run_status.as_mut() else {
            return;
        };
        if !rx.has_changed().unwrap_or(false) {
            return;
        }
        let status = *rx.borrow_and_update();
        let counts = self
            .orchestrator
            .as_ref()
            .map(|o| o.counts())
            .unwrap_or_default();
        self.status_message = match status.state {
            RunState::Idle => "Campaign ready.".to_string(),
            RunState::Running => format!("Sending batch {}...", status.current_batch),
            RunState::Paused => {
                if self.credentials.has_token() {
                    "Campaign paused.".to_string()
                } else {
                    "Campaign paused. Connect a Gmail account to continue.".to_string()
                }
            }
            RunState::Completed => format!(
                "Campaign completed. Sent: {}, Failed: {}",
                counts.sent, counts.failed
            ),
        };
    }

    fn handle_dropped_files(&mut self, ctx: &egui::Context) {
        let dropped = ctx.input(|i| i.raw.dropped_files.clone());
        for file in dropped {
            match self.step {
                Step::Compose => {
                    let attachment = match (&file.path, &file.bytes) {
                        (Some(path), _) => Attachment::from_path(path),
                        (None, Some(bytes)) => {
                            Ok(Attachment::from_bytes(file.name.clone(), bytes.to_vec()))
                        }
                        (None, None) => continue,
                    };
                    self.add_attachment(attachment, &file.name);
                }
                Step::Recipients => {
                    if let Some(path) = &file.path {
                        self.import_recipient_file(path);
                    } else if let Some(bytes) = &file.bytes {
                        match std::str::from_utf8(bytes) {
                            Ok(text) => self.set_recipients(parse_recipients(text)),
                            Err(_) => {
                                self.status_message =
                                    format!("ERROR: {} is not a text file", file.name)
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn add_attachment(&mut self, attachment: std::io::Result<Attachment>, label: &str) {
        match attachment {
            Ok(attachment) => {
                self.status_message = format!("Attached {}", attachment.filename);
                self.attachments.push(attachment);
            }
            Err(e) => self.status_message = format!("ERROR reading {}: {}", label, e),
        }
    }

    fn import_recipient_file(&mut self, path: &Path) {
        match read_recipient_file(path) {
            Ok(recipients) => self.set_recipients(recipients),
            Err(e) => self.status_message = format!("ERROR importing recipients: {}", e),
        }
    }

    fn set_recipients(&mut self, recipients: Vec<Recipient>) {
        let summary = ImportSummary::from(recipients.as_slice());
        self.status_message = format!(
            "Imported {} recipients ({} valid, {} invalid)",
            summary.total, summary.valid, summary.invalid
        );
        self.recipients = recipients;
        self.import_summary = Some(summary);
    }

    fn connect_gmail(&mut self, ctx: &egui::Context) {
        let Some(gmail) = self.gmail.clone() else {
            self.status_message = "Gmail client is unavailable.".to_string();
            return;
        };
        self.connecting = true;
        self.status_message = "Waiting for Google sign-in in your browser...".to_string();

        let flow = flow_for(&self.config.oauth);
        let store = self.credentials.clone();
        let sender = self.sender.clone();
        let ctx = ctx.clone();
        self.tokio_rt.spawn(async move {
            let result = connect_account(flow.as_ref(), &store, &gmail)
                .await
                .map_err(|e| e.to_string());
            sender.send(Message::AccountConnected(result)).ok();
            ctx.request_repaint();
        });
    }

    fn select_account(&mut self, account: Account) {
        if let Err(e) = self.credentials.select_account(&account.id) {
            warn!("Could not remember the selected account: {}", e);
        }
        self.selected_account = Some(account);
    }

    fn remove_account(&mut self, id: &str) {
        if let Err(e) = self.credentials.remove_account(id) {
            self.status_message = format!("ERROR removing account: {}", e);
            return;
        }
        self.accounts.retain(|a| a.id != id);
        if self.selected_account.as_ref().is_some_and(|a| a.id == id) {
            self.selected_account = None;
        }
    }

    fn spawn_run(&self, ctx: &egui::Context) {
        let Some(orchestrator) = self.orchestrator.clone() else {
            return;
        };
        let sender = self.sender.clone();
        let ctx = ctx.clone();
        self.tokio_rt.spawn(async move {
            let state = orchestrator.run().await;
            sender.send(Message::RunFinished(state)).ok();
            ctx.request_repaint();
        });
    }

    fn handle_start(&mut self, ctx: &egui::Context) {
        let Some(orchestrator) = self.orchestrator.clone() else {
            return;
        };
        let template = match EmailTemplate::from_content(&self.subject, &self.body, "campaign") {
            Ok(template) => template,
            Err(e) => {
                self.status_message = format!("ERROR in email template: {}", e);
                return;
            }
        };
        let email = ComposedEmail {
            template,
            attachments: self.attachments.clone(),
        };
        match orchestrator.start(
            self.selected_account.as_ref(),
            &self.recipients,
            email,
            self.campaign.clone(),
        ) {
            Ok(()) => self.spawn_run(ctx),
            Err(e) => {
                if e.is_configuration_error() {
                    self.step = if self.selected_account.is_none() {
                        Step::Account
                    } else {
                        Step::Recipients
                    };
                }
                self.status_message = e.to_string();
            }
        }
    }

    fn handle_resume(&mut self, ctx: &egui::Context) {
        let Some(orchestrator) = self.orchestrator.clone() else {
            return;
        };
        match orchestrator.resume() {
            Ok(()) => self.spawn_run(ctx),
            Err(e) => self.status_message = e.to_string(),
        }
    }

    fn ui_steps(&self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            for (i, step) in Step::ALL.iter().enumerate() {
                let text = format!("{}. {}", i + 1, step.title());
                let label = if *step == self.step {
                    RichText::new(text).strong().color(Color32::from_rgb(0x25, 0x63, 0xEB))
                } else if step.index() < self.step.index() {
                    RichText::new(text).color(Color32::from_rgb(0x16, 0xA3, 0x4A))
                } else {
                    RichText::new(text).color(Color32::GRAY)
                };
                ui.label(label);
                if i + 1 < Step::ALL.len() {
                    ui.label("›");
                }
            }
        });
    }

    fn ui_account(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        ui.heading("Select Gmail Account");
        ui.label("Choose the account the campaign is sent from.");
        ui.add_space(8.0);

        let mut chosen = None;
        let mut removed = None;
        egui::Frame::group(ui.style()).show(ui, |ui| {
            if self.accounts.is_empty() {
                ui.label("(No accounts connected)");
            }
            for account in &self.accounts {
                ui.horizontal(|ui| {
                    let selected = self
                        .selected_account
                        .as_ref()
                        .is_some_and(|a| a.id == account.id);
                    if ui
                        .radio(selected, account.label())
                        .clicked()
                    {
                        chosen = Some(account.clone());
                    }
                    let is_demo = demo_accounts().iter().any(|d| d.id == account.id);
                    if !is_demo {
                        ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                            let remove = egui::Button::new(
                                RichText::new("X").color(Color32::DARK_RED).size(10.0),
                            )
                            .frame(false);
                            if ui.add(remove).on_hover_text("Remove account").clicked() {
                                removed = Some(account.id.clone());
                            }
                        });
                    }
                });
            }
        });
        if let Some(account) = chosen {
            self.select_account(account);
        }
        if let Some(id) = removed {
            self.remove_account(&id);
        }

        ui.add_space(10.0);
        ui.horizontal(|ui| {
            let connect = egui::Button::new("Connect Gmail account");
            if ui.add_enabled(!self.connecting, connect).clicked() {
                self.connect_gmail(ctx);
            }
            if self.connecting {
                ui.spinner();
            }
            if self.credentials.has_token() && ui.button("Sign out").clicked() {
                match self.credentials.clear_access_token() {
                    Ok(()) => self.status_message = "Signed out.".to_string(),
                    Err(e) => self.status_message = format!("ERROR signing out: {}", e),
                }
            }
        });
        if !self.credentials.has_token() {
            ui.label(
                RichText::new("Not signed in: sending requires a connected Gmail account.")
                    .italics(),
            );
        }
    }

    fn ui_compose(&mut self, ui: &mut egui::Ui) {
        ui.heading("Compose Email");
        ui.add_space(5.0);

        ui.horizontal(|ui| {
            ui.label("Template file:");
            ui.text_edit_singleline(&mut self.template_path_input);
            if ui.button("Load").clicked() && !self.template_path_input.trim().is_empty() {
                Self::spawn_template_load(
                    self.sender.clone(),
                    PathBuf::from(self.template_path_input.trim()),
                );
            }
        });
        ui.add_space(8.0);

        ui.horizontal(|ui| {
            ui.label("Subject:");
            ui.add(egui::TextEdit::singleline(&mut self.subject).desired_width(f32::INFINITY));
        });
        ui.add_space(8.0);

        ui.label("Body (HTML, may use {{ recipient_email }}, {{ sender_name }}, ...):");
        egui::ScrollArea::vertical()
            .max_height(260.0)
            .auto_shrink([false, true])
            .show(ui, |ui| {
                ui.add(
                    egui::TextEdit::multiline(&mut self.body)
                        .desired_width(f32::INFINITY)
                        .desired_rows(12)
                        .code_editor(),
                );
            });
        ui.add_space(8.0);

        ui.label("Attachments (drop files here or enter a path):");
        ui.horizontal(|ui| {
            ui.text_edit_singleline(&mut self.attachment_path_input);
            if ui.button("Attach").clicked() && !self.attachment_path_input.trim().is_empty() {
                let path = PathBuf::from(self.attachment_path_input.trim());
                let label = path.display().to_string();
                self.add_attachment(Attachment::from_path(&path), &label);
                self.attachment_path_input.clear();
            }
        });
        let mut remove = None;
        for (index, attachment) in self.attachments.iter().enumerate() {
            ui.horizontal(|ui| {
                ui.label(format!(
                    "{} ({:.1} KB, {})",
                    attachment.filename,
                    attachment.size_kb(),
                    attachment.content_type
                ));
                if ui
                    .add(egui::Button::new(RichText::new("X").color(Color32::DARK_RED)).frame(false))
                    .clicked()
                {
                    remove = Some(index);
                }
            });
        }
        if let Some(index) = remove {
            self.attachments.remove(index);
        }
    }

    fn ui_recipients(&mut self, ui: &mut egui::Ui) {
        ui.heading("Import Recipients");
        ui.label("CSV or TXT, one email address per line. Files can be dropped here.");
        ui.add_space(5.0);

        ui.horizontal(|ui| {
            ui.label("File:");
            ui.text_edit_singleline(&mut self.recipient_path_input);
            if ui.button("Import").clicked() && !self.recipient_path_input.trim().is_empty() {
                let path = PathBuf::from(self.recipient_path_input.trim());
                self.import_recipient_file(&path);
            }
        });

        ui.label("Or paste addresses:");
        ui.add(
            egui::TextEdit::multiline(&mut self.pasted_recipients)
                .desired_width(f32::INFINITY)
                .desired_rows(5),
        );
        if ui.button("Use pasted list").clicked() {
            let recipients = parse_recipients(&self.pasted_recipients);
            self.set_recipients(recipients);
        }
        ui.add_space(8.0);

        let Some(summary) = &self.import_summary else {
            return;
        };
        egui::Grid::new("import_summary_grid")
            .num_columns(2)
            .spacing([10.0, 4.0])
            .show(ui, |ui| {
                ui.label("Total:");
                ui.label(summary.total.to_string());
                ui.end_row();
                ui.label("Valid:");
                ui.label(RichText::new(summary.valid.to_string()).color(status_color(EmailStatus::Sent)));
                ui.end_row();
                ui.label("Invalid:");
                ui.label(RichText::new(summary.invalid.to_string()).color(status_color(EmailStatus::Failed)));
                ui.end_row();
            });

        if !summary.warnings.is_empty() {
            ui.add_space(5.0);
            ui.label("Rejected lines:");
            egui::Frame::group(ui.style()).show(ui, |ui| {
                egui::ScrollArea::vertical()
                    .id_salt("recipient_warnings")
                    .max_height(120.0)
                    .auto_shrink([false, true])
                    .show(ui, |ui| {
                        for (line, reason) in &summary.warnings {
                            ui.label(format!("{}: {}", line, reason));
                        }
                    });
            });
        }

        ui.add_space(8.0);
        ui.horizontal(|ui| {
            ui.label("Save valid list to:");
            ui.text_edit_singleline(&mut self.export_path_input);
            if ui.button("Save").clicked() && !self.export_path_input.trim().is_empty() {
                let path = PathBuf::from(self.export_path_input.trim());
                self.status_message = match write_recipient_list(&path, &self.recipients) {
                    Ok(()) => format!("Saved valid recipients to {}", path.display()),
                    Err(e) => format!("ERROR saving recipients: {}", e),
                };
            }
        });
    }

    fn ui_settings(&mut self, ui: &mut egui::Ui) {
        ui.heading("Campaign Settings");
        ui.add_space(5.0);

        egui::Grid::new("campaign_settings_grid")
            .num_columns(2)
            .spacing([10.0, 8.0])
            .show(ui, |ui| {
                ui.label("Campaign name:");
                ui.text_edit_singleline(&mut self.campaign.name);
                ui.end_row();

                ui.label("Batch size:");
                ui.add(egui::Slider::new(&mut self.campaign.batch_size, BATCH_SIZE_RANGE));
                ui.end_row();

                ui.label("Delay between batches:");
                ui.add(
                    egui::Slider::new(&mut self.campaign.delay_between_batches, BATCH_DELAY_RANGE)
                        .suffix(" s"),
                );
                ui.end_row();

                ui.label("Delay between emails:");
                ui.add(
                    egui::Slider::new(&mut self.campaign.delay_between_emails, EMAIL_DELAY_RANGE)
                        .suffix(" s"),
                );
                ui.end_row();

                ui.label("Retry failed emails:");
                ui.checkbox(&mut self.campaign.retry_failed_emails, "");
                ui.end_row();

                ui.label("Max retries:");
                ui.add_enabled(
                    self.campaign.retry_failed_emails,
                    egui::Slider::new(&mut self.campaign.max_retries, MAX_RETRIES_RANGE),
                );
                ui.end_row();

                ui.label("Send mode:");
                ui.horizontal(|ui| {
                    ui.radio_value(&mut self.campaign.send_mode, SendMode::Standard, "Standard");
                    ui.radio_value(&mut self.campaign.send_mode, SendMode::Bulk, "Bulk");
                });
                ui.end_row();
            });

        ui.add_space(5.0);
        let explanation = match self.campaign.send_mode {
            SendMode::Standard => "One personalized message per recipient.".to_string(),
            SendMode::Bulk => format!(
                "One message per {} recipients, all visible in the To header.",
                MAX_RECIPIENTS_PER_MESSAGE
            ),
        };
        ui.label(RichText::new(explanation).italics());
    }

    fn ui_review(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        ui.heading("Review & Send");
        ui.add_space(5.0);

        let invalid = self.recipients.len() - self.valid_recipient_count();
        egui::Grid::new("review_grid")
            .num_columns(2)
            .spacing([10.0, 4.0])
            .show(ui, |ui| {
                ui.label("From:");
                ui.label(
                    self.selected_account
                        .as_ref()
                        .map(Account::label)
                        .unwrap_or_else(|| "(none)".to_string()),
                );
                ui.end_row();
                ui.label("Subject:");
                ui.label(&self.subject);
                ui.end_row();
                ui.label("Attachments:");
                ui.label(self.attachments.len().to_string());
                ui.end_row();
                ui.label("Recipients:");
                ui.label(format!("{} valid, {} invalid", self.valid_recipient_count(), invalid));
                ui.end_row();
                ui.label("Settings:");
                ui.label(format!(
                    "{} per batch, {}s between batches, {}s between emails, retries {}",
                    self.campaign.batch_size,
                    self.campaign.delay_between_batches,
                    self.campaign.delay_between_emails,
                    if self.campaign.retry_failed_emails {
                        format!("up to {}", self.campaign.max_retries)
                    } else {
                        "off".to_string()
                    }
                ));
                ui.end_row();
                ui.label("Estimated time:");
                let estimate = self.campaign.clone().clamped().estimated_duration(self.message_count());
                ui.label(format_elapsed(estimate));
                ui.end_row();
            });
        ui.add_space(10.0);

        let state = self.run_state();
        ui.horizontal(|ui| {
            if ui
                .add_enabled(state == RunState::Idle, egui::Button::new("Start Campaign"))
                .clicked()
            {
                self.handle_start(ctx);
            }
            if ui
                .add_enabled(state == RunState::Running, egui::Button::new("Pause"))
                .clicked()
            {
                if let Some(orchestrator) = &self.orchestrator {
                    if let Err(e) = orchestrator.pause() {
                        self.status_message = e.to_string();
                    }
                }
            }
            if ui
                .add_enabled(state == RunState::Paused, egui::Button::new("Resume"))
                .clicked()
            {
                self.handle_resume(ctx);
            }
            if ui
                .add_enabled(state != RunState::Idle, egui::Button::new("Restart"))
                .clicked()
            {
                if let Some(orchestrator) = &self.orchestrator {
                    orchestrator.restart();
                }
            }
        });

        let Some(orchestrator) = self.orchestrator.clone() else {
            return;
        };
        if orchestrator.counts().total() == 0 {
            return;
        }
        ui.add_space(10.0);
        self.ui_progress(ui, &orchestrator);
        ui.add_space(10.0);
        self.ui_log(ui, &orchestrator);
    }

    fn ui_progress(&self, ui: &mut egui::Ui, orchestrator: &Orchestrator) {
        let report = orchestrator.progress();
        ui.add(
            egui::ProgressBar::new(report.percent as f32 / 100.0)
                .text(format!("{}%", report.percent))
                .desired_width(f32::INFINITY),
        );
        egui::Grid::new("progress_grid")
            .num_columns(4)
            .spacing([20.0, 4.0])
            .show(ui, |ui| {
                ui.label(format!("Total: {}", report.counts.total()));
                ui.label(format!("Sent: {}", report.counts.sent));
                ui.label(format!("Pending: {}", report.outstanding()));
                ui.label(format!("Failed: {}", report.counts.failed));
                ui.end_row();
                ui.label(format!(
                    "Batch {} of {}",
                    report.current_batch, report.total_batches
                ));
                ui.label(format!("Elapsed: {}", format_elapsed(report.elapsed)));
                ui.label(format!("{} / min", report.per_minute));
                ui.end_row();
            });
    }

    fn ui_log(&mut self, ui: &mut egui::Ui, orchestrator: &Orchestrator) {
        ui.horizontal(|ui| {
            ui.label("Email log:");
            ui.selectable_value(&mut self.log_filter, LogFilter::All, "All");
            ui.selectable_value(&mut self.log_filter, LogFilter::Sent, "Sent");
            ui.selectable_value(&mut self.log_filter, LogFilter::Pending, "Pending");
            ui.selectable_value(&mut self.log_filter, LogFilter::Failed, "Failed");
        });

        let entries = orchestrator.ledger_entries();
        egui::Frame::group(ui.style()).show(ui, |ui| {
            egui::ScrollArea::vertical()
                .id_salt("email_log")
                .max_height(240.0)
                .auto_shrink([false, false])
                .show(ui, |ui| {
                    egui::Grid::new("email_log_grid")
                        .num_columns(4)
                        .striped(true)
                        .show(ui, |ui| {
                            for entry in entries.iter().filter(|e| self.log_filter.accepts(e.status)) {
                                ui.label(&entry.target);
                                ui.label(
                                    RichText::new(entry.status.as_str())
                                        .color(status_color(entry.status)),
                                );
                                ui.label(
                                    entry
                                        .timestamp
                                        .map(|t| {
                                            t.with_timezone(&chrono::Local)
                                                .format("%H:%M:%S")
                                                .to_string()
                                        })
                                        .unwrap_or_default(),
                                );
                                let mut detail = entry.error_message.clone().unwrap_or_default();
                                if let Some(retries) = entry.retry_count {
                                    detail = format!("{} (retry {})", detail, retries);
                                }
                                ui.label(detail);
                                ui.end_row();
                            }
                        });
                });
        });
    }
}

impl eframe::App for RapidMailApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.process_messages();
        self.handle_dropped_files(ctx);

        let running = self.run_state() == RunState::Running;

        // Status bar at the bottom
        egui::TopBottomPanel::bottom("status_panel")
            .frame(egui::Frame::new().inner_margin(Margin::symmetric(10, 5)))
            .show(ctx, |ui| {
                ui.horizontal(|ui| {
                    if running || self.connecting {
                        ui.add(egui::Spinner::new().size(14.0));
                        ui.add_space(5.0);
                    }
                    ui.label(&self.status_message);
                });
            });

        // Back / Next navigation
        egui::TopBottomPanel::bottom("navigation_panel")
            .frame(egui::Frame::new().inner_margin(Margin::symmetric(15, 8)))
            .show(ctx, |ui| {
                ui.horizontal(|ui| {
                    if ui
                        .add_enabled(self.step != Step::Account, egui::Button::new("Back"))
                        .clicked()
                    {
                        self.step = self.step.previous();
                    }
                    ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                        let can_advance =
                            self.step != Step::Review && self.step_complete(self.step);
                        if ui
                            .add_enabled(can_advance, egui::Button::new("Next"))
                            .clicked()
                        {
                            self.step = self.step.next();
                        }
                    });
                });
            });

        egui::CentralPanel::default()
            .frame(egui::Frame::new().inner_margin(Margin::same(15)))
            .show(ctx, |ui| {
                ui.heading("RapidMail");
                self.ui_steps(ui);
                ui.separator();
                ui.add_space(10.0);

                egui::ScrollArea::vertical()
                    .id_salt("step_content")
                    .auto_shrink([false, false])
                    .show(ui, |ui| match self.step {
                        Step::Account => self.ui_account(ui, ctx),
                        Step::Compose => self.ui_compose(ui),
                        Step::Recipients => self.ui_recipients(ui),
                        Step::Settings => self.ui_settings(ui),
                        Step::Review => self.ui_review(ui, ctx),
                    });
            });

        if running || self.connecting {
            ctx.request_repaint_after(Duration::from_millis(250));
        }
    }
}
